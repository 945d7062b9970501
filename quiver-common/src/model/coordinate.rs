use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{QuiverError, Result};

/// (organization, name) pair: the unit of version reconciliation. At most
/// one version per module survives a resolved graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Module {
    pub organization: String,
    pub name: String,
}

impl Module {
    pub fn new(organization: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.organization, self.name)
    }
}

/// Globally unique identifier for one artifact version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub module: Module,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier: Option<String>,
    #[serde(default = "default_ext")]
    pub ext: String,
}

fn default_ext() -> String {
    "jar".to_string()
}

impl Coordinate {
    pub fn new(module: Module, version: impl Into<String>) -> Self {
        Self {
            module,
            version: version.into(),
            classifier: None,
            ext: default_ext(),
        }
    }

    pub fn with_classifier(mut self, classifier: impl Into<String>) -> Self {
        self.classifier = Some(classifier.into());
        self
    }

    pub fn with_ext(mut self, ext: impl Into<String>) -> Self {
        self.ext = ext.into();
        self
    }

    /// Parse `org:name:version`, optionally followed by `:ext` and
    /// `:classifier` (`org:name:version:ext:classifier`).
    pub fn parse(input: &str) -> Result<Self> {
        let parts: Vec<&str> = input.split(':').collect();
        if !(3..=5).contains(&parts.len()) || parts.iter().any(|p| p.is_empty()) {
            return Err(QuiverError::Config(format!(
                "malformed coordinate '{input}': expected org:name:version[:ext[:classifier]]"
            )));
        }
        let mut coordinate = Coordinate::new(Module::new(parts[0], parts[1]), parts[2]);
        if let Some(ext) = parts.get(3) {
            coordinate.ext = (*ext).to_string();
        }
        if let Some(classifier) = parts.get(4) {
            coordinate.classifier = Some((*classifier).to_string());
        }
        Ok(coordinate)
    }

    /// The filename of this artifact within a repository directory:
    /// `name-version[-classifier].ext`.
    pub fn file_name(&self) -> String {
        match &self.classifier {
            Some(classifier) => format!(
                "{}-{}-{}.{}",
                self.module.name, self.version, classifier, self.ext
            ),
            None => format!("{}-{}.{}", self.module.name, self.version, self.ext),
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.version)
    }
}

/// Dependency scope. `Import` never survives into the graph: it splices the
/// target's dependency-management section instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Compile,
    Runtime,
    Test,
    Provided,
    System,
    Import,
}

impl Default for Scope {
    fn default() -> Self {
        Scope::Compile
    }
}

impl Scope {
    pub fn parse(input: &str) -> Option<Scope> {
        match input.trim() {
            "compile" => Some(Scope::Compile),
            "runtime" => Some(Scope::Runtime),
            "test" => Some(Scope::Test),
            "provided" => Some(Scope::Provided),
            "system" => Some(Scope::System),
            "import" => Some(Scope::Import),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Compile => "compile",
            Scope::Runtime => "runtime",
            Scope::Test => "test",
            Scope::Provided => "provided",
            Scope::System => "system",
            Scope::Import => "import",
        }
    }

    /// Scope transition table for transitive edges. `declared` is the scope
    /// on the dependency declaration, `inherited` the scope under which the
    /// declaring module itself was reached. `None` drops the edge from the
    /// transitive closure.
    pub fn transition(declared: Scope, inherited: Scope) -> Option<Scope> {
        use Scope::*;
        match (declared, inherited) {
            (Compile, Compile) => Some(Compile),
            (Compile, Runtime) => Some(Runtime),
            (Runtime, Compile) => Some(Runtime),
            (Runtime, Runtime) => Some(Runtime),
            _ => None,
        }
    }

    /// Precedence used when a node is reached under several scopes;
    /// the strongest one survives.
    pub fn precedence(&self) -> u8 {
        match self {
            Scope::Compile => 5,
            Scope::Runtime => 4,
            Scope::Provided => 3,
            Scope::System => 2,
            Scope::Test => 1,
            Scope::Import => 0,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pattern of an exclusion set: an (organization-pattern,
/// name-pattern) pair where `*` matches any value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Exclusion {
    pub organization: String,
    pub name: String,
}

impl Exclusion {
    pub fn new(organization: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            name: name.into(),
        }
    }

    pub fn matches(&self, module: &Module) -> bool {
        (self.organization == "*" || self.organization == module.organization)
            && (self.name == "*" || self.name == module.name)
    }

    pub fn is_wildcard(&self) -> bool {
        self.organization == "*" && self.name == "*"
    }
}

/// Drop entries already covered by a wider wildcard entry.
pub fn normalize_exclusions(exclusions: &mut std::collections::BTreeSet<Exclusion>) {
    if exclusions.iter().any(Exclusion::is_wildcard) {
        exclusions.clear();
        exclusions.insert(Exclusion::new("*", "*"));
        return;
    }
    let org_wildcards: Vec<String> = exclusions
        .iter()
        .filter(|e| e.name == "*")
        .map(|e| e.organization.clone())
        .collect();
    let name_wildcards: Vec<String> = exclusions
        .iter()
        .filter(|e| e.organization == "*")
        .map(|e| e.name.clone())
        .collect();
    exclusions.retain(|e| {
        if e.organization == "*" || e.name == "*" {
            return true;
        }
        !org_wildcards.contains(&e.organization) && !name_wildcards.contains(&e.name)
    });
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn parse_three_part_coordinate() {
        let coordinate = Coordinate::parse("org.example:widget:1.2.3").unwrap();
        assert_eq!(coordinate.module, Module::new("org.example", "widget"));
        assert_eq!(coordinate.version, "1.2.3");
        assert_eq!(coordinate.ext, "jar");
        assert_eq!(coordinate.classifier, None);
    }

    #[test]
    fn parse_five_part_coordinate() {
        let coordinate = Coordinate::parse("org.example:widget:1.2.3:zip:sources").unwrap();
        assert_eq!(coordinate.ext, "zip");
        assert_eq!(coordinate.classifier.as_deref(), Some("sources"));
        assert_eq!(coordinate.file_name(), "widget-1.2.3-sources.zip");
    }

    #[test]
    fn parse_rejects_empty_parts() {
        assert!(Coordinate::parse("org.example::1.0").is_err());
        assert!(Coordinate::parse("org.example:widget").is_err());
    }

    #[test]
    fn scope_transition_table() {
        use Scope::*;
        assert_eq!(Scope::transition(Compile, Compile), Some(Compile));
        assert_eq!(Scope::transition(Compile, Runtime), Some(Runtime));
        assert_eq!(Scope::transition(Runtime, Compile), Some(Runtime));
        assert_eq!(Scope::transition(Runtime, Runtime), Some(Runtime));
        assert_eq!(Scope::transition(Provided, Compile), None);
        assert_eq!(Scope::transition(Test, Compile), None);
        assert_eq!(Scope::transition(Compile, Test), None);
    }

    #[test]
    fn exclusion_wildcards() {
        let module = Module::new("org.acme", "core");
        assert!(Exclusion::new("*", "*").matches(&module));
        assert!(Exclusion::new("org.acme", "*").matches(&module));
        assert!(Exclusion::new("*", "core").matches(&module));
        assert!(!Exclusion::new("org.acme", "other").matches(&module));
    }

    #[test]
    fn exclusion_normalization_keeps_widest() {
        let mut set: BTreeSet<Exclusion> = [
            Exclusion::new("org.acme", "core"),
            Exclusion::new("org.acme", "*"),
            Exclusion::new("com.other", "thing"),
        ]
        .into_iter()
        .collect();
        normalize_exclusions(&mut set);
        assert!(set.contains(&Exclusion::new("org.acme", "*")));
        assert!(!set.contains(&Exclusion::new("org.acme", "core")));
        assert!(set.contains(&Exclusion::new("com.other", "thing")));

        let mut all: BTreeSet<Exclusion> = [
            Exclusion::new("*", "*"),
            Exclusion::new("org.acme", "core"),
        ]
        .into_iter()
        .collect();
        normalize_exclusions(&mut all);
        assert_eq!(all.len(), 1);
    }
}
