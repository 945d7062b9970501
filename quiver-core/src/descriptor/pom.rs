use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use quiver_common::error::{QuiverError, Result};
use quiver_common::model::{
    normalize_exclusions, Activation, DeclaredDependency, Descriptor, Exclusion, Module,
    OpaqueElement, Parent, Profile,
};
use roxmltree::{Document, Node};

/// Top-level elements the model understands; everything else is kept as
/// an opaque body.
const KNOWN_ELEMENTS: &[&str] = &[
    "modelVersion",
    "groupId",
    "artifactId",
    "version",
    "packaging",
    "parent",
    "dependencies",
    "dependencyManagement",
    "properties",
    "profiles",
];

/// Parse an XML project descriptor.
pub fn parse(bytes: &[u8], source_name: &str) -> Result<Descriptor> {
    let text = std::str::from_utf8(bytes).map_err(|e| QuiverError::ParseError {
        source_name: source_name.to_string(),
        offset: e.valid_up_to(),
        reason: "descriptor is not valid UTF-8".to_string(),
    })?;
    let doc = Document::parse(text).map_err(|e| QuiverError::ParseError {
        source_name: source_name.to_string(),
        offset: byte_offset(text, e.pos().row, e.pos().col),
        reason: e.to_string(),
    })?;
    let project = doc.root_element();

    let mut descriptor = Descriptor::new(
        Module::new(
            child_text(&project, "groupId").unwrap_or_default(),
            child_text(&project, "artifactId").unwrap_or_default(),
        ),
        child_text(&project, "version").unwrap_or_default(),
    );
    if let Some(packaging) = child_text(&project, "packaging") {
        descriptor.packaging = packaging;
    }

    if let Some(parent_node) = child_element(&project, "parent") {
        let parent = Parent {
            module: Module::new(
                child_text(&parent_node, "groupId").unwrap_or_default(),
                child_text(&parent_node, "artifactId").unwrap_or_default(),
            ),
            version: child_text(&parent_node, "version").unwrap_or_default(),
        };
        // A child may omit its own coordinates and take the parent's.
        if descriptor.module.organization.is_empty() {
            descriptor.module.organization = parent.module.organization.clone();
        }
        if descriptor.version.is_empty() {
            descriptor.version = parent.version.clone();
        }
        descriptor.parent = Some(parent);
    }

    if descriptor.module.name.is_empty() {
        return Err(QuiverError::ParseError {
            source_name: source_name.to_string(),
            offset: 0,
            reason: "missing artifactId".to_string(),
        });
    }

    if let Some(properties) = child_element(&project, "properties") {
        descriptor.properties = parse_properties(&properties);
    }
    if let Some(deps) = child_element(&project, "dependencies") {
        descriptor.dependencies = parse_dependencies(&deps);
    }
    if let Some(dep_mgmt) = child_element(&project, "dependencyManagement") {
        if let Some(deps) = child_element(&dep_mgmt, "dependencies") {
            descriptor.dependency_management = parse_dependencies(&deps);
        }
    }
    if let Some(profiles) = child_element(&project, "profiles") {
        descriptor.profiles = profiles
            .children()
            .filter(|n| n.is_element() && n.has_tag_name("profile"))
            .map(|n| parse_profile(&n))
            .collect();
    }

    // Unknown elements survive as raw bodies for round-trip debugging.
    for child in project.children().filter(Node::is_element) {
        let name = child.tag_name().name();
        if !KNOWN_ELEMENTS.contains(&name) {
            descriptor.unknown.push(OpaqueElement {
                name: name.to_string(),
                body: text[child.range()].to_string(),
            });
        }
    }

    Ok(descriptor)
}

fn byte_offset(text: &str, row: u32, col: u32) -> usize {
    let mut offset = 0usize;
    for (i, line) in text.split_inclusive('\n').enumerate() {
        if i + 1 == row as usize {
            return offset + (col as usize).saturating_sub(1).min(line.len());
        }
        offset += line.len();
    }
    offset
}

fn child_element<'a, 'input>(
    node: &Node<'a, 'input>,
    name: &str,
) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.has_tag_name(name))
}

fn child_text(node: &Node<'_, '_>, name: &str) -> Option<String> {
    child_element(node, name)
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn parse_properties(node: &Node<'_, '_>) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    for child in node.children().filter(Node::is_element) {
        let value = child.text().map(str::trim).unwrap_or_default();
        properties.insert(child.tag_name().name().to_string(), value.to_string());
    }
    properties
}

fn parse_dependencies(node: &Node<'_, '_>) -> Vec<DeclaredDependency> {
    node.children()
        .filter(|n| n.is_element() && n.has_tag_name("dependency"))
        .filter_map(|dep_node| {
            let organization = child_text(&dep_node, "groupId")?;
            let name = child_text(&dep_node, "artifactId")?;
            let mut exclusions = BTreeSet::new();
            if let Some(exclusions_node) = child_element(&dep_node, "exclusions") {
                for exclusion in exclusions_node
                    .children()
                    .filter(|n| n.is_element() && n.has_tag_name("exclusion"))
                {
                    let organization = child_text(&exclusion, "groupId");
                    let name = child_text(&exclusion, "artifactId");
                    if let (Some(organization), Some(name)) = (organization, name) {
                        exclusions.insert(Exclusion::new(organization, name));
                    }
                }
                normalize_exclusions(&mut exclusions);
            }
            Some(DeclaredDependency {
                organization,
                name,
                version: child_text(&dep_node, "version"),
                scope: child_text(&dep_node, "scope"),
                optional: child_text(&dep_node, "optional")
                    .map(|v| v.eq_ignore_ascii_case("true")),
                classifier: child_text(&dep_node, "classifier"),
                ext: child_text(&dep_node, "type"),
                exclusions,
            })
        })
        .collect()
}

fn parse_profile(node: &Node<'_, '_>) -> Profile {
    let mut activation = Activation::default();
    if let Some(activation_node) = child_element(node, "activation") {
        activation.active_by_default = child_text(&activation_node, "activeByDefault")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        if let Some(property) = child_element(&activation_node, "property") {
            let name = child_text(&property, "name").unwrap_or_default();
            activation.property = match child_text(&property, "value") {
                Some(value) => Some(format!("{name}={value}")),
                None => Some(name),
            };
        }
        if let Some(os) = child_element(&activation_node, "os") {
            activation.os_name = child_text(&os, "name");
            activation.os_family = child_text(&os, "family");
            activation.os_arch = child_text(&os, "arch");
        }
        activation.jdk = child_text(&activation_node, "jdk");
        if let Some(file) = child_element(&activation_node, "file") {
            activation.file_exists = child_text(&file, "exists").map(PathBuf::from);
            activation.file_missing = child_text(&file, "missing").map(PathBuf::from);
        }
    }

    Profile {
        id: child_text(node, "id").unwrap_or_default(),
        activation,
        dependencies: child_element(node, "dependencies")
            .map(|n| parse_dependencies(&n))
            .unwrap_or_default(),
        dependency_management: child_element(node, "dependencyManagement")
            .and_then(|dm| child_element(&dm, "dependencies"))
            .map(|n| parse_dependencies(&n))
            .unwrap_or_default(),
        properties: child_element(node, "properties")
            .map(|n| parse_properties(&n))
            .unwrap_or_default(),
    }
}
