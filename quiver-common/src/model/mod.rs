pub mod coordinate;
pub mod descriptor;
pub mod version;

pub use coordinate::{normalize_exclusions, Coordinate, Exclusion, Module, Scope};
pub use descriptor::{
    substitute, Activation, ActivationContext, DeclaredDependency, Descriptor, OpaqueElement,
    Parent, Profile,
};
pub use version::{LatestKind, Version, VersionConstraint, VersionRange};
