use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use talon_core::error::{Result, TalonError};
use talon_core::types::WorkflowId;

/// Input for one capability execution: the agent binding plus the merged
/// context view the node's phase observes.
#[derive(Debug, Clone)]
pub struct HandlerInput {
    pub workflow_id: WorkflowId,
    pub agent_id: String,
    pub capability: String,
    pub context: HashMap<String, serde_json::Value>,
}

/// A compiled capability implementation.
///
/// Handlers are registered at startup under their capability name; there
/// is no path-based loading of handler code at run time. The returned
/// value is merged into the workflow context under the capability name.
pub trait CapabilityHandler: Send + Sync + 'static {
    /// Capability name this handler implements.
    fn capability(&self) -> &str;

    fn execute(&self, input: HandlerInput) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Hard bound on a single execution.
    fn timeout_secs(&self) -> u64 {
        600
    }
}

/// Static registry mapping capability name to a compiled handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CapabilityHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its capability name.
    pub fn register(&mut self, handler: impl CapabilityHandler) {
        let capability = handler.capability().to_string();
        self.handlers.insert(capability, Arc::new(handler));
    }

    pub fn get(&self, capability: &str) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers.get(capability).cloned()
    }

    pub fn capabilities(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    /// Execute the handler for a capability, bounded by its timeout.
    ///
    /// A missing handler is a configuration error (the capability was
    /// registered in the store without a compiled implementation) and is
    /// not worth retrying.
    pub async fn execute(
        &self,
        capability: &str,
        input: HandlerInput,
    ) -> Result<serde_json::Value> {
        let handler = self.get(capability).ok_or_else(|| {
            TalonError::Config(format!(
                "No handler registered for capability '{}'",
                capability
            ))
        })?;

        let timeout = std::time::Duration::from_secs(handler.timeout_secs());
        match tokio::time::timeout(timeout, handler.execute(input)).await {
            Ok(result) => result,
            Err(_) => Err(TalonError::ToolTimeout {
                module: capability.to_string(),
                timeout_secs: handler.timeout_secs(),
            }),
        }
    }
}
