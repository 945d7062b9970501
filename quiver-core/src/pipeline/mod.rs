pub mod runner;
pub mod source;

pub use runner::{drive, Orchestrator, ResolutionOutcome};
pub use source::{DescriptorSource, RemoteSource};
