pub mod context;
pub mod graph;
pub mod handler;
pub mod instance;
pub mod manager;
pub mod registry;
pub mod scheduler;

pub use context::WorkflowContext;
pub use graph::{ExecutionGraph, GraphBuilder, GraphEdge, Resolution, ResolvedNode};
pub use handler::{CapabilityHandler, HandlerInput, HandlerRegistry};
pub use instance::WorkflowInstance;
pub use manager::{WorkflowManager, WorkflowProgress, WorkflowTemplate};
pub use registry::{CapabilityRegistry, RegistrySnapshot};
pub use scheduler::{PhaseScheduler, WorkflowControl};
