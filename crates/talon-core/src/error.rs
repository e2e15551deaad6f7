use thiserror::Error;

#[derive(Debug, Error)]
pub enum TalonError {
    // Build-time errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No available agent for required capability: {capability}")]
    CapabilityResolution { capability: String },

    #[error("Dependency cycle detected at node: {node}")]
    CycleDetected { node: String },

    // Execution errors
    #[error("Node {node} failed after {attempts} attempt(s): {message}")]
    NodeExecution {
        node: String,
        message: String,
        attempts: u32,
    },

    #[error("Workflow cancelled")]
    Cancelled,

    // Collaborator errors
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Tool execution failed: {module}: {message}")]
    Tool { module: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {module}")]
    ToolTimeout { module: String, timeout_secs: u64 },

    // Storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TalonError>;
