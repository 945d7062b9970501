use std::collections::BTreeSet;

use quiver_common::error::{QuiverError, Result};
use quiver_common::model::{
    normalize_exclusions, DeclaredDependency, Descriptor, Exclusion, Module, OpaqueElement, Parent,
};

/// Parse the tabular descriptor dialect: `key=value` headers followed by
/// bracketed sections.
///
/// ```text
/// # widget 1.2.0
/// module=org.acme:widget
/// version=1.2.0
/// packaging=jar
/// parent=org.acme:acme-parent:7
///
/// [properties]
/// dep.version=2.4
///
/// [dependencies]
/// org.dep:thing:${dep.version} scope=runtime exclusions=org.bad:*
/// org.dep:other:1.0 optional
///
/// [dependency-management]
/// org.pin:pinned:9.9
/// ```
pub fn parse(bytes: &[u8], source_name: &str) -> Result<Descriptor> {
    let text = std::str::from_utf8(bytes).map_err(|e| QuiverError::ParseError {
        source_name: source_name.to_string(),
        offset: e.valid_up_to(),
        reason: "descriptor is not valid UTF-8".to_string(),
    })?;

    let mut descriptor = Descriptor::new(Module::new("", ""), "");
    let mut section: Option<String> = None;
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        let line_offset = offset;
        offset += line.len();
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if let Some(name) = trimmed.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            section = Some(name.trim().to_ascii_lowercase());
            continue;
        }

        let parse_error = |reason: String| QuiverError::ParseError {
            source_name: source_name.to_string(),
            offset: line_offset,
            reason,
        };

        match section.as_deref() {
            None => {
                let (key, value) = trimmed
                    .split_once('=')
                    .ok_or_else(|| parse_error(format!("expected key=value, got '{trimmed}'")))?;
                let key = key.trim();
                let value = value.trim();
                match key {
                    "module" => {
                        let (organization, name) = value.split_once(':').ok_or_else(|| {
                            parse_error(format!("expected org:name, got '{value}'"))
                        })?;
                        descriptor.module = Module::new(organization.trim(), name.trim());
                    }
                    "version" => descriptor.version = value.to_string(),
                    "packaging" => descriptor.packaging = value.to_string(),
                    "parent" => {
                        let parts: Vec<&str> = value.split(':').collect();
                        if parts.len() != 3 {
                            return Err(parse_error(format!(
                                "expected org:name:version, got '{value}'"
                            )));
                        }
                        descriptor.parent = Some(Parent {
                            module: Module::new(parts[0].trim(), parts[1].trim()),
                            version: parts[2].trim().to_string(),
                        });
                    }
                    // Unknown headers are kept, not rejected.
                    other => descriptor.unknown.push(OpaqueElement {
                        name: other.to_string(),
                        body: value.to_string(),
                    }),
                }
            }
            Some("properties") => {
                let (key, value) = trimmed
                    .split_once('=')
                    .ok_or_else(|| parse_error(format!("expected key=value, got '{trimmed}'")))?;
                descriptor
                    .properties
                    .insert(key.trim().to_string(), value.trim().to_string());
            }
            Some("dependencies") => {
                descriptor
                    .dependencies
                    .push(parse_dependency_line(trimmed).map_err(parse_error)?);
            }
            Some("dependency-management") => {
                descriptor
                    .dependency_management
                    .push(parse_dependency_line(trimmed).map_err(parse_error)?);
            }
            Some(other) => {
                descriptor.unknown.push(OpaqueElement {
                    name: other.to_string(),
                    body: trimmed.to_string(),
                });
            }
        }
    }

    if descriptor.module.name.is_empty() {
        return Err(QuiverError::ParseError {
            source_name: source_name.to_string(),
            offset: 0,
            reason: "missing module header".to_string(),
        });
    }
    Ok(descriptor)
}

/// `org:name[:version] [scope=..] [optional] [classifier=..] [type=..]
/// [exclusions=org:name,org:*]`
fn parse_dependency_line(line: &str) -> std::result::Result<DeclaredDependency, String> {
    let mut fields = line.split_whitespace();
    let coordinate = fields.next().ok_or_else(|| "empty dependency".to_string())?;
    let parts: Vec<&str> = coordinate.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(format!("expected org:name[:version], got '{coordinate}'"));
    }

    let mut dependency = DeclaredDependency {
        organization: parts[0].to_string(),
        name: parts[1].to_string(),
        version: parts.get(2).map(|v| v.to_string()),
        ..Default::default()
    };

    for field in fields {
        if field == "optional" {
            dependency.optional = Some(true);
            continue;
        }
        let Some((key, value)) = field.split_once('=') else {
            return Err(format!("expected key=value attribute, got '{field}'"));
        };
        match key {
            "scope" => dependency.scope = Some(value.to_string()),
            "classifier" => dependency.classifier = Some(value.to_string()),
            "type" => dependency.ext = Some(value.to_string()),
            "optional" => dependency.optional = Some(value == "true"),
            "exclusions" => {
                let mut exclusions = BTreeSet::new();
                for pattern in value.split(',').filter(|p| !p.is_empty()) {
                    let (organization, name) = pattern
                        .split_once(':')
                        .ok_or_else(|| format!("expected org:name exclusion, got '{pattern}'"))?;
                    exclusions.insert(Exclusion::new(organization, name));
                }
                normalize_exclusions(&mut exclusions);
                dependency.exclusions = exclusions;
            }
            other => return Err(format!("unknown dependency attribute '{other}'")),
        }
    }
    Ok(dependency)
}
