use quiver_common::error::{QuiverError, Result};
use quiver_common::model::{LatestKind, Module, Version, VersionConstraint};
use roxmltree::{Document, Node};

/// The repository-maintained version listing (maven-metadata) for one
/// module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionListing {
    pub latest: Option<String>,
    pub release: Option<String>,
    pub versions: Vec<String>,
}

impl VersionListing {
    pub fn parse(bytes: &[u8], source_name: &str) -> Result<VersionListing> {
        let text = std::str::from_utf8(bytes).map_err(|e| QuiverError::ParseError {
            source_name: source_name.to_string(),
            offset: e.valid_up_to(),
            reason: "listing is not valid UTF-8".to_string(),
        })?;
        let doc = Document::parse(text).map_err(|e| QuiverError::ParseError {
            source_name: source_name.to_string(),
            offset: 0,
            reason: e.to_string(),
        })?;
        let metadata = doc.root_element();
        let mut listing = VersionListing::default();
        if let Some(versioning) = child(&metadata, "versioning") {
            listing.latest = child_text(&versioning, "latest");
            listing.release = child_text(&versioning, "release");
            if let Some(versions) = child(&versioning, "versions") {
                listing.versions = versions
                    .children()
                    .filter(|n| n.is_element() && n.has_tag_name("version"))
                    .filter_map(|n| n.text())
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect();
            }
        }
        Ok(listing)
    }

    /// Resolve a symbolic or range constraint against the listed versions.
    pub fn resolve(&self, module: &Module, constraint: &VersionConstraint) -> Result<String> {
        let resolved = match constraint {
            VersionConstraint::Exact(v) | VersionConstraint::Soft(v) => Some(v.clone()),
            VersionConstraint::Latest(LatestKind::Integration) => {
                self.latest.clone().or_else(|| self.highest(|_| true))
            }
            VersionConstraint::Latest(LatestKind::Release) => self
                .release
                .clone()
                .or_else(|| self.highest(|v| !v.is_snapshot())),
            VersionConstraint::Ranges(_) => {
                self.highest(|v| constraint.matches(v))
            }
        };
        resolved.ok_or_else(|| {
            QuiverError::UnknownVersion(format!("{module} matching {constraint}"))
        })
    }

    fn highest(&self, accept: impl Fn(&Version) -> bool) -> Option<String> {
        self.versions
            .iter()
            .map(|raw| (Version::parse(raw), raw))
            .filter(|(version, _)| accept(version))
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, raw)| raw.clone())
    }
}

fn child<'a, 'input>(node: &Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.has_tag_name(name))
}

fn child_text(node: &Node<'_, '_>, name: &str) -> Option<String> {
    child(node, name)
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<metadata>
  <groupId>org.acme</groupId>
  <artifactId>widget</artifactId>
  <versioning>
    <latest>2.1-SNAPSHOT</latest>
    <release>2.0</release>
    <versions>
      <version>1.0</version>
      <version>1.5</version>
      <version>2.0</version>
      <version>2.1-SNAPSHOT</version>
    </versions>
    <lastUpdated>20240101000000</lastUpdated>
  </versioning>
</metadata>
"#;

    fn module() -> Module {
        Module::new("org.acme", "widget")
    }

    #[test]
    fn parses_versioning() {
        let listing = VersionListing::parse(SAMPLE.as_bytes(), "maven-metadata.xml").unwrap();
        assert_eq!(listing.latest.as_deref(), Some("2.1-SNAPSHOT"));
        assert_eq!(listing.release.as_deref(), Some("2.0"));
        assert_eq!(listing.versions.len(), 4);
    }

    #[test]
    fn resolves_latest_and_release() {
        let listing = VersionListing::parse(SAMPLE.as_bytes(), "maven-metadata.xml").unwrap();
        assert_eq!(
            listing
                .resolve(&module(), &VersionConstraint::Latest(LatestKind::Integration))
                .unwrap(),
            "2.1-SNAPSHOT"
        );
        assert_eq!(
            listing
                .resolve(&module(), &VersionConstraint::Latest(LatestKind::Release))
                .unwrap(),
            "2.0"
        );
    }

    #[test]
    fn resolves_ranges_to_highest_match() {
        let listing = VersionListing::parse(SAMPLE.as_bytes(), "maven-metadata.xml").unwrap();
        let range = VersionConstraint::parse("[1.0,2.0)").unwrap();
        assert_eq!(listing.resolve(&module(), &range).unwrap(), "1.5");
    }

    #[test]
    fn closed_upper_range_picks_available_not_bound() {
        // The upper bound names no published version here; the range must
        // still land on the highest listed match.
        let listing = VersionListing {
            latest: None,
            release: None,
            versions: vec!["1.0".into(), "1.5".into(), "1.9".into()],
        };
        let range = VersionConstraint::parse("[1.0,2.0]").unwrap();
        assert_eq!(listing.resolve(&module(), &range).unwrap(), "1.9");

        // And when the bound itself is published, it wins as the highest.
        let full = VersionListing::parse(SAMPLE.as_bytes(), "maven-metadata.xml").unwrap();
        assert_eq!(full.resolve(&module(), &range).unwrap(), "2.0");
    }

    #[test]
    fn empty_listing_fails_unknown_version() {
        let listing = VersionListing::default();
        let err = listing
            .resolve(&module(), &VersionConstraint::Latest(LatestKind::Release))
            .unwrap_err();
        assert!(matches!(err, QuiverError::UnknownVersion(_)));

        let range = VersionConstraint::parse("[9.0,)").unwrap();
        let populated = VersionListing::parse(SAMPLE.as_bytes(), "maven-metadata.xml").unwrap();
        let err = populated.resolve(&module(), &range).unwrap_err();
        assert!(matches!(err, QuiverError::UnknownVersion(_)));
    }

    #[test]
    fn release_falls_back_to_highest_stable() {
        let listing = VersionListing {
            latest: None,
            release: None,
            versions: vec!["1.0".into(), "2.1-SNAPSHOT".into(), "1.9".into()],
        };
        assert_eq!(
            listing
                .resolve(&module(), &VersionConstraint::Latest(LatestKind::Release))
                .unwrap(),
            "1.9"
        );
    }
}
