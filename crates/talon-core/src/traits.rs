use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// AI completion provider (non-streaming).
///
/// Every engine call site that uses this has a documented deterministic
/// fallback; a `Provider` error from here is caught at the call site and
/// never propagates as fatal on its own.
pub trait CompletionClient: Send + Sync + 'static {
    fn complete(
        &self,
        options: CompletionOptions,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<Completion>>;
}

/// External tool executor, one per module type.
///
/// Implementations must be retry-safe and must never hang indefinitely;
/// callers additionally wrap `execute` in `timeout_secs`.
pub trait ToolRunner: Send + Sync + 'static {
    /// Module category this runner handles.
    fn module_type(&self) -> ModuleType;

    fn execute(&self, module: ModuleSpec, target: Target)
        -> BoxFuture<'_, Result<ExecutionOutcome>>;

    /// Hard bound on a single execution.
    fn timeout_secs(&self) -> u64 {
        300
    }
}

/// Capability/dependency store.
///
/// `register_agent` and `unregister_agent` mutate the store only; the
/// owning `CapabilityRegistry` refreshes its snapshot after either call.
pub trait AgentStore: Send + Sync + 'static {
    fn load_agents(&self) -> BoxFuture<'_, Result<Vec<AgentRecord>>>;

    fn register_agent(&self, record: AgentRecord) -> BoxFuture<'_, Result<()>>;

    fn unregister_agent(&self, agent_id: String) -> BoxFuture<'_, Result<()>>;
}

/// Persistence for workflow instances.
///
/// `save` is the checkpoint write; an error from it must reach the caller
/// since the checkpoint may not have been durably stored.
pub trait WorkflowStore: Send + Sync + 'static {
    fn save(&self, snapshot: WorkflowSnapshot) -> BoxFuture<'_, Result<()>>;

    fn load(&self, id: WorkflowId) -> BoxFuture<'_, Result<Option<WorkflowSnapshot>>>;

    fn delete(&self, id: WorkflowId) -> BoxFuture<'_, Result<()>>;

    fn list(&self) -> BoxFuture<'_, Result<Vec<(WorkflowId, WorkflowStatus)>>>;
}
