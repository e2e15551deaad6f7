pub mod builder;
pub mod node;

pub use builder::{ExecutionGraph, GraphBuilder, GraphEdge, Resolution, SkippedDependency};
pub use node::ResolvedNode;
