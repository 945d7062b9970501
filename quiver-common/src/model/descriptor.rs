use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{QuiverError, Result};
use crate::model::coordinate::{normalize_exclusions, Exclusion, Module};

/// Reference to the descriptor a module inherits from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parent {
    pub module: Module,
    pub version: String,
}

/// A dependency (or dependency-management entry) exactly as declared,
/// before inheritance, profile merging and property substitution. String
/// fields may still contain `${...}` references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredDependency {
    pub organization: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub exclusions: BTreeSet<Exclusion>,
}

impl DeclaredDependency {
    pub fn module(&self) -> Module {
        Module::new(self.organization.clone(), self.name.clone())
    }

    pub fn key(&self) -> (String, String) {
        (self.organization.clone(), self.name.clone())
    }
}

/// Profile activation conditions. All configured conditions must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    #[serde(default)]
    pub active_by_default: bool,
    /// `name`, `name=value`, or `!name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_arch: Option<String>,
    /// Prefix match against the running JDK version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jdk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_exists: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_missing: Option<PathBuf>,
}

impl Activation {
    fn has_condition(&self) -> bool {
        self.property.is_some()
            || self.os_name.is_some()
            || self.os_family.is_some()
            || self.os_arch.is_some()
            || self.jdk.is_some()
            || self.file_exists.is_some()
            || self.file_missing.is_some()
    }

    pub fn is_active(&self, ctx: &ActivationContext) -> bool {
        if !self.has_condition() {
            return self.active_by_default;
        }
        if let Some(property) = &self.property {
            let holds = match property.strip_prefix('!') {
                Some(name) => !ctx.properties.contains_key(name.trim()),
                None => match property.split_once('=') {
                    Some((name, value)) => {
                        ctx.properties.get(name.trim()).map(String::as_str) == Some(value.trim())
                    }
                    None => ctx.properties.contains_key(property.trim()),
                },
            };
            if !holds {
                return false;
            }
        }
        if let Some(name) = &self.os_name {
            if !name.eq_ignore_ascii_case(&ctx.os_name) {
                return false;
            }
        }
        if let Some(family) = &self.os_family {
            if !family.eq_ignore_ascii_case(&ctx.os_family) {
                return false;
            }
        }
        if let Some(arch) = &self.os_arch {
            if !arch.eq_ignore_ascii_case(&ctx.os_arch) {
                return false;
            }
        }
        if let Some(jdk) = &self.jdk {
            if !ctx.jdk_version.starts_with(jdk.trim()) {
                return false;
            }
        }
        if let Some(path) = &self.file_exists {
            if !path.exists() {
                return false;
            }
        }
        if let Some(path) = &self.file_missing {
            if path.exists() {
                return false;
            }
        }
        true
    }
}

/// Environment against which profile activation is evaluated.
#[derive(Debug, Clone, Default)]
pub struct ActivationContext {
    pub properties: BTreeMap<String, String>,
    pub os_name: String,
    pub os_family: String,
    pub os_arch: String,
    pub jdk_version: String,
}

impl ActivationContext {
    pub fn current() -> Self {
        let os = std::env::consts::OS;
        let family = match os {
            "linux" | "macos" | "freebsd" | "openbsd" | "netbsd" => "unix",
            "windows" => "windows",
            other => other,
        };
        Self {
            properties: BTreeMap::new(),
            os_name: os.to_string(),
            os_family: family.to_string(),
            os_arch: std::env::consts::ARCH.to_string(),
            jdk_version: String::new(),
        }
    }
}

/// An activation-gated descriptor fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DeclaredDependency>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependency_management: Vec<DeclaredDependency>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

/// Element the parser did not recognize, kept for round-trip debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpaqueElement {
    pub name: String,
    pub body: String,
}

/// In-memory form of one module descriptor. Immutable once constructed;
/// the merge operations below all return new values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub module: Module,
    pub version: String,
    #[serde(default = "default_packaging")]
    pub packaging: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Parent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DeclaredDependency>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependency_management: Vec<DeclaredDependency>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<Profile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unknown: Vec<OpaqueElement>,
}

fn default_packaging() -> String {
    "jar".to_string()
}

impl Descriptor {
    pub fn new(module: Module, version: impl Into<String>) -> Self {
        Self {
            module,
            version: version.into(),
            packaging: default_packaging(),
            ..Default::default()
        }
    }

    /// Merge a parent descriptor into this one. Child values win; parent
    /// dependencies and managed entries are appended where the child does
    /// not already declare the module.
    pub fn inherit(&self, parent: &Descriptor) -> Descriptor {
        let mut merged = self.clone();

        if merged.module.organization.is_empty() {
            merged.module.organization = parent.module.organization.clone();
        }
        if merged.version.is_empty() {
            merged.version = parent.version.clone();
        }

        let mut properties = parent.properties.clone();
        properties.extend(merged.properties);
        // The parent reference is folded away below, so the parent
        // coordinate built-ins have to survive as ordinary properties.
        properties.insert(
            "project.parent.groupId".to_string(),
            parent.module.organization.clone(),
        );
        properties.insert(
            "project.parent.artifactId".to_string(),
            parent.module.name.clone(),
        );
        properties.insert(
            "project.parent.version".to_string(),
            parent.version.clone(),
        );
        merged.properties = properties;

        let declared: BTreeSet<(String, String)> =
            merged.dependencies.iter().map(|d| d.key()).collect();
        for dep in &parent.dependencies {
            if !declared.contains(&dep.key()) {
                merged.dependencies.push(dep.clone());
            }
        }

        let managed: BTreeSet<(String, String)> = merged
            .dependency_management
            .iter()
            .map(|d| d.key())
            .collect();
        for entry in &parent.dependency_management {
            if !managed.contains(&entry.key()) {
                merged.dependency_management.push(entry.clone());
            }
        }

        // The chain above this parent has already been folded in by the
        // resolver, one level at a time.
        merged.parent = None;
        merged
    }

    /// Fold the bodies of every active profile into the descriptor, as if
    /// they had been declared directly.
    pub fn activate_profiles(&self, ctx: &ActivationContext) -> Descriptor {
        let mut merged = self.clone();
        for profile in &self.profiles {
            if !profile.activation.is_active(ctx) {
                continue;
            }
            debug!(profile = %profile.id, module = %self.module, "activating profile");
            merged.properties.extend(profile.properties.clone());
            merged.dependencies.extend(profile.dependencies.clone());
            merged
                .dependency_management
                .extend(profile.dependency_management.clone());
        }
        merged.profiles.clear();
        merged
    }

    /// Apply `${...}` substitution to every string field. Must run after
    /// [`Descriptor::inherit`] and [`Descriptor::activate_profiles`] so
    /// that inherited and profile-contributed properties are visible.
    pub fn substitute_properties(&self, extra: &BTreeMap<String, String>) -> Result<Descriptor> {
        let mut props = extra.clone();
        props.extend(self.properties.clone());
        props.insert(
            "project.groupId".to_string(),
            self.module.organization.clone(),
        );
        props.insert("project.artifactId".to_string(), self.module.name.clone());
        props.insert("project.version".to_string(), self.version.clone());
        if let Some(parent) = &self.parent {
            props.insert(
                "project.parent.groupId".to_string(),
                parent.module.organization.clone(),
            );
            props.insert(
                "project.parent.artifactId".to_string(),
                parent.module.name.clone(),
            );
            props.insert("project.parent.version".to_string(), parent.version.clone());
        }

        let mut substituted = self.clone();
        substituted.version = substitute(&self.version, &props)?;
        substituted.packaging = substitute(&self.packaging, &props)?;
        for dep in substituted
            .dependencies
            .iter_mut()
            .chain(substituted.dependency_management.iter_mut())
        {
            substitute_dependency(dep, &props)?;
        }
        Ok(substituted)
    }

    /// Managed entries keyed by module, later entries never overriding
    /// earlier ones (child-before-parent order is set up by `inherit`).
    pub fn managed_index(&self) -> BTreeMap<(String, String), &DeclaredDependency> {
        let mut index = BTreeMap::new();
        for entry in &self.dependency_management {
            index.entry(entry.key()).or_insert(entry);
        }
        index
    }
}

fn substitute_dependency(
    dep: &mut DeclaredDependency,
    props: &BTreeMap<String, String>,
) -> Result<()> {
    dep.organization = substitute(&dep.organization, props)?;
    dep.name = substitute(&dep.name, props)?;
    if let Some(version) = dep.version.take() {
        dep.version = Some(substitute(&version, props)?);
    }
    if let Some(scope) = dep.scope.take() {
        dep.scope = Some(substitute(&scope, props)?);
    }
    if let Some(classifier) = dep.classifier.take() {
        dep.classifier = Some(substitute(&classifier, props)?);
    }
    let mut exclusions = BTreeSet::new();
    for exclusion in std::mem::take(&mut dep.exclusions) {
        let organization = substitute(&exclusion.organization, props)?;
        let name = substitute(&exclusion.name, props)?;
        if !organization.is_empty() && !name.is_empty() {
            exclusions.insert(Exclusion::new(organization, name));
        }
    }
    normalize_exclusions(&mut exclusions);
    dep.exclusions = exclusions;
    Ok(())
}

/// Recursively expand `${name}` references. Unknown references are left in
/// place (descriptors in the wild rely on this); reference cycles fail with
/// `PropertyCycle`.
pub fn substitute(input: &str, props: &BTreeMap<String, String>) -> Result<String> {
    let mut visiting = Vec::new();
    substitute_inner(input, props, &mut visiting)
}

fn substitute_inner(
    input: &str,
    props: &BTreeMap<String, String>,
    visiting: &mut Vec<String>,
) -> Result<String> {
    if !input.contains("${") {
        return Ok(input.to_string());
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated reference; keep it literally.
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = after[..end].trim();
        match lookup(name, props) {
            Some(value) => {
                if visiting.iter().any(|seen| seen == name) {
                    return Err(QuiverError::PropertyCycle(name.to_string()));
                }
                visiting.push(name.to_string());
                let expanded = substitute_inner(&value, props, visiting)?;
                visiting.pop();
                out.push_str(&expanded);
            }
            None => {
                out.push_str("${");
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn lookup(name: &str, props: &BTreeMap<String, String>) -> Option<String> {
    if let Some(value) = props.get(name) {
        return Some(value.clone());
    }
    if let Some(env_name) = name.strip_prefix("env.") {
        return std::env::var(env_name).ok();
    }
    // Process-property equivalents of the JVM system properties.
    std::env::var(name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitution_basic_and_recursive() {
        let p = props(&[("a", "1"), ("b", "${a}.2"), ("c", "v${b}")]);
        assert_eq!(substitute("x-${a}", &p).unwrap(), "x-1");
        assert_eq!(substitute("${c}", &p).unwrap(), "v1.2");
        // Unknown names stay literal.
        assert_eq!(substitute("${nope}", &p).unwrap(), "${nope}");
        // Unterminated references stay literal.
        assert_eq!(substitute("${a", &p).unwrap(), "${a");
    }

    #[test]
    fn substitution_cycle_detected() {
        let p = props(&[("a", "${b}"), ("b", "${a}")]);
        let err = substitute("${a}", &p).unwrap_err();
        assert!(matches!(err, QuiverError::PropertyCycle(_)));
    }

    #[test]
    fn builtin_project_properties() {
        let mut descriptor = Descriptor::new(Module::new("org.acme", "core"), "2.1");
        descriptor.dependencies.push(DeclaredDependency {
            organization: "${project.groupId}".to_string(),
            name: "util".to_string(),
            version: Some("${project.version}".to_string()),
            ..Default::default()
        });
        let substituted = descriptor.substitute_properties(&BTreeMap::new()).unwrap();
        let dep = &substituted.dependencies[0];
        assert_eq!(dep.organization, "org.acme");
        assert_eq!(dep.version.as_deref(), Some("2.1"));
    }

    #[test]
    fn inherit_child_wins_properties_parent_adds_deps() {
        let mut parent = Descriptor::new(Module::new("org.acme", "parent"), "1");
        parent
            .properties
            .insert("shared".to_string(), "parent".to_string());
        parent
            .properties
            .insert("only.parent".to_string(), "yes".to_string());
        parent.dependencies.push(DeclaredDependency {
            organization: "org.acme".to_string(),
            name: "base".to_string(),
            version: Some("1".to_string()),
            ..Default::default()
        });
        parent.dependency_management.push(DeclaredDependency {
            organization: "org.acme".to_string(),
            name: "managed".to_string(),
            version: Some("9".to_string()),
            ..Default::default()
        });

        let mut child = Descriptor::new(Module::new("org.acme", "child"), "1");
        child
            .properties
            .insert("shared".to_string(), "child".to_string());
        child.dependency_management.push(DeclaredDependency {
            organization: "org.acme".to_string(),
            name: "managed".to_string(),
            version: Some("10".to_string()),
            ..Default::default()
        });

        let merged = child.inherit(&parent);
        assert_eq!(merged.properties.get("shared").unwrap(), "child");
        assert_eq!(merged.properties.get("only.parent").unwrap(), "yes");
        assert_eq!(merged.dependencies.len(), 1);
        let managed = merged.managed_index();
        assert_eq!(
            managed[&("org.acme".to_string(), "managed".to_string())]
                .version
                .as_deref(),
            Some("10")
        );
    }

    #[test]
    fn inherited_property_visible_to_substitution() {
        let mut parent = Descriptor::new(Module::new("org.acme", "parent"), "1");
        parent
            .properties
            .insert("dep.version".to_string(), "3.3".to_string());
        let mut child = Descriptor::new(Module::new("org.acme", "child"), "1");
        child.dependencies.push(DeclaredDependency {
            organization: "org.acme".to_string(),
            name: "widget".to_string(),
            version: Some("${dep.version}".to_string()),
            ..Default::default()
        });
        let effective = child
            .inherit(&parent)
            .substitute_properties(&BTreeMap::new())
            .unwrap();
        assert_eq!(effective.dependencies[0].version.as_deref(), Some("3.3"));
    }

    #[test]
    fn parent_builtins_resolve_after_inherit() {
        let parent = Descriptor::new(Module::new("org.acme", "acme-parent"), "7");
        let mut child = Descriptor::new(Module::new("org.acme", "child"), "1.2");
        child.parent = Some(Parent {
            module: parent.module.clone(),
            version: parent.version.clone(),
        });
        // Sibling dependency pinned to the parent's version, the common
        // reactor idiom.
        child.dependencies.push(DeclaredDependency {
            organization: "${project.parent.groupId}".to_string(),
            name: "sibling".to_string(),
            version: Some("${project.parent.version}".to_string()),
            ..Default::default()
        });

        // inherit() clears the parent reference; the built-ins must still
        // resolve afterwards.
        let merged = child.inherit(&parent);
        assert!(merged.parent.is_none());
        let effective = merged.substitute_properties(&BTreeMap::new()).unwrap();
        let dep = &effective.dependencies[0];
        assert_eq!(dep.organization, "org.acme");
        assert_eq!(dep.version.as_deref(), Some("7"));
        // The child's own version is untouched by the parent built-ins.
        assert_eq!(effective.version, "1.2");
    }

    #[test]
    fn profile_property_activation() {
        let mut descriptor = Descriptor::new(Module::new("org.acme", "app"), "1");
        descriptor.profiles.push(Profile {
            id: "extras".to_string(),
            activation: Activation {
                property: Some("with.extras".to_string()),
                ..Default::default()
            },
            dependencies: vec![DeclaredDependency {
                organization: "org.acme".to_string(),
                name: "extra".to_string(),
                version: Some("1".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        });

        let inactive = descriptor.activate_profiles(&ActivationContext::default());
        assert!(inactive.dependencies.is_empty());

        let mut ctx = ActivationContext::default();
        ctx.properties
            .insert("with.extras".to_string(), String::new());
        let active = descriptor.activate_profiles(&ctx);
        assert_eq!(active.dependencies.len(), 1);
    }

    #[test]
    fn profile_negated_property_and_value_match() {
        let negated = Activation {
            property: Some("!skip".to_string()),
            ..Default::default()
        };
        let mut ctx = ActivationContext::default();
        assert!(negated.is_active(&ctx));
        ctx.properties.insert("skip".to_string(), String::new());
        assert!(!negated.is_active(&ctx));

        let valued = Activation {
            property: Some("mode=fast".to_string()),
            ..Default::default()
        };
        ctx.properties.insert("mode".to_string(), "slow".to_string());
        assert!(!valued.is_active(&ctx));
        ctx.properties.insert("mode".to_string(), "fast".to_string());
        assert!(valued.is_active(&ctx));
    }

    #[test]
    fn profile_os_activation() {
        let ctx = ActivationContext::current();
        let matching = Activation {
            os_name: Some(ctx.os_name.clone()),
            ..Default::default()
        };
        assert!(matching.is_active(&ctx));
        let other = Activation {
            os_name: Some("plan9".to_string()),
            ..Default::default()
        };
        assert!(!other.is_active(&ctx));
    }

    #[test]
    fn active_by_default_only_without_conditions() {
        let default_on = Activation {
            active_by_default: true,
            ..Default::default()
        };
        assert!(default_on.is_active(&ActivationContext::default()));

        let gated = Activation {
            active_by_default: true,
            property: Some("flag".to_string()),
            ..Default::default()
        };
        assert!(!gated.is_active(&ActivationContext::default()));
    }

    #[test]
    fn descriptor_serde_round_trip() {
        let mut descriptor = Descriptor::new(Module::new("org.acme", "core"), "1.0");
        descriptor.parent = Some(Parent {
            module: Module::new("org.acme", "parent"),
            version: "7".to_string(),
        });
        descriptor.dependencies.push(DeclaredDependency {
            organization: "org.dep".to_string(),
            name: "thing".to_string(),
            version: Some("2".to_string()),
            scope: Some("runtime".to_string()),
            exclusions: [Exclusion::new("org.bad", "*")].into_iter().collect(),
            ..Default::default()
        });
        descriptor.unknown.push(OpaqueElement {
            name: "distributionManagement".to_string(),
            body: "<site/>".to_string(),
        });
        let json = serde_json::to_string(&descriptor).unwrap();
        let back: Descriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, descriptor);
    }
}
