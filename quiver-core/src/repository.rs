use quiver_common::error::{QuiverError, Result};
use quiver_common::model::{Coordinate, Descriptor, Module};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::descriptor::{flat, pom};

/// Descriptor dialect a repository serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    /// Nested-element XML project descriptors (`.pom`).
    Xml,
    /// Newline-delimited key/value descriptors (`.deps`).
    Flat,
}

impl Dialect {
    pub fn descriptor_ext(&self) -> &'static str {
        match self {
            Dialect::Xml => "pom",
            Dialect::Flat => "deps",
        }
    }
}

/// One remote repository. Repositories are consulted in configuration
/// order; the first descriptor found wins.
#[derive(Debug, Clone)]
pub struct Repository {
    pub name: String,
    pub base: Url,
    pub dialect: Dialect,
    /// Snapshot repositories: cached entries are revalidated per TTL.
    pub changing: bool,
}

impl Repository {
    pub fn new(name: impl Into<String>, base: &str, dialect: Dialect) -> Result<Self> {
        let base = Url::parse(base)
            .map_err(|e| QuiverError::Config(format!("bad repository URL '{base}': {e}")))?;
        Ok(Self {
            name: name.into(),
            base,
            dialect,
            changing: false,
        })
    }

    pub fn maven(name: impl Into<String>, base: &str) -> Result<Self> {
        Self::new(name, base, Dialect::Xml)
    }

    pub fn central() -> Self {
        Self::maven("central", "https://repo1.maven.org/maven2")
            .expect("central URL is well-formed")
    }

    pub fn with_changing(mut self, changing: bool) -> Self {
        self.changing = changing;
        self
    }

    fn join(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                QuiverError::Config(format!("repository URL cannot be a base: {}", self.base))
            })?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    /// `<org-with-slashes>/<name>/<version>/<name>-<version>.<ext>`
    pub fn descriptor_url(&self, module: &Module, version: &str) -> Result<Url> {
        let mut segments: Vec<&str> = module.organization.split('.').collect();
        segments.push(&module.name);
        segments.push(version);
        let file = format!(
            "{}-{}.{}",
            module.name,
            version,
            self.dialect.descriptor_ext()
        );
        segments.push(&file);
        self.join(&segments)
    }

    pub fn artifact_url(&self, coordinate: &Coordinate) -> Result<Url> {
        let mut segments: Vec<&str> = coordinate.module.organization.split('.').collect();
        segments.push(&coordinate.module.name);
        segments.push(&coordinate.version);
        let file = coordinate.file_name();
        segments.push(&file);
        self.join(&segments)
    }

    /// The repository-maintained version listing for a module.
    pub fn version_listing_url(&self, module: &Module) -> Result<Url> {
        let mut segments: Vec<&str> = module.organization.split('.').collect();
        segments.push(&module.name);
        segments.push("maven-metadata.xml");
        self.join(&segments)
    }

    /// Whether a given version is mutable on this repository.
    pub fn is_changing_version(&self, version: &str) -> bool {
        self.changing || version.to_ascii_uppercase().ends_with("-SNAPSHOT")
    }

    pub fn parse_descriptor(&self, bytes: &[u8], source_name: &str) -> Result<Descriptor> {
        match self.dialect {
            Dialect::Xml => pom::parse(bytes, source_name),
            Dialect::Flat => flat::parse(bytes, source_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> Repository {
        Repository::maven("central", "https://repo1.maven.org/maven2").unwrap()
    }

    #[test]
    fn descriptor_url_layout() {
        let url = repo()
            .descriptor_url(&Module::new("org.acme.platform", "widget"), "1.2.0")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://repo1.maven.org/maven2/org/acme/platform/widget/1.2.0/widget-1.2.0.pom"
        );
    }

    #[test]
    fn artifact_url_with_classifier() {
        let coordinate = Coordinate::new(Module::new("org.acme", "widget"), "1.2.0")
            .with_classifier("sources")
            .with_ext("jar");
        let url = repo().artifact_url(&coordinate).unwrap();
        assert_eq!(
            url.as_str(),
            "https://repo1.maven.org/maven2/org/acme/widget/1.2.0/widget-1.2.0-sources.jar"
        );
    }

    #[test]
    fn listing_url_layout() {
        let url = repo()
            .version_listing_url(&Module::new("org.acme", "widget"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://repo1.maven.org/maven2/org/acme/widget/maven-metadata.xml"
        );
    }

    #[test]
    fn trailing_slash_base_is_equivalent() {
        let with_slash = Repository::maven("m", "https://repo.example.com/maven/").unwrap();
        let without = Repository::maven("m", "https://repo.example.com/maven").unwrap();
        let module = Module::new("org.acme", "widget");
        assert_eq!(
            with_slash.descriptor_url(&module, "1").unwrap(),
            without.descriptor_url(&module, "1").unwrap()
        );
    }

    #[test]
    fn changing_versions() {
        let stable = repo();
        assert!(stable.is_changing_version("1.0-SNAPSHOT"));
        assert!(stable.is_changing_version("1.0-snapshot"));
        assert!(!stable.is_changing_version("1.0"));
        let snapshots = repo().with_changing(true);
        assert!(snapshots.is_changing_version("1.0"));
    }

    #[test]
    fn flat_dialect_extension() {
        let flat = Repository::new("internal", "https://repo.example.com", Dialect::Flat).unwrap();
        let url = flat
            .descriptor_url(&Module::new("org.acme", "widget"), "2")
            .unwrap();
        assert!(url.as_str().ends_with("/widget-2.deps"));
    }
}
