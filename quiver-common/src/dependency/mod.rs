pub mod resolver;

pub use resolver::{
    ConflictReport, DescriptorRequest, DescriptorResponse, ReconciliationPolicy, ResolutionError,
    ResolvedDescriptor, ResolvedEdge, ResolvedGraph, ResolvedNode, Resolver, ResolverOptions,
};
