use serde::{Deserialize, Serialize};
use tracing::debug;

use talon_core::types::NodeStatus;

/// A capability resolved to a concrete agent, placed in an execution phase.
///
/// The node id is the capability name: resolution picks exactly one agent
/// per capability, so capability names are unique within one graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedNode {
    /// Node id == capability name.
    pub id: String,
    /// Agent chosen to provide the capability.
    pub agent_id: String,
    /// Capability name (same as `id`, kept for readability at call sites).
    pub capability: String,
    /// Execution phase: `1 + max(phase of dependencies)`, 0 with none.
    pub phase: u32,
    /// Node ids this node depends on (included edges only).
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub status: NodeStatus,
    /// Retries consumed by the last execution (0 = first attempt worked).
    #[serde(default)]
    pub retry_count: u32,
    /// Last error, when the node failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Output produced on completion, merged into context under the
    /// capability name.
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

impl ResolvedNode {
    pub fn new(capability: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let capability = capability.into();
        Self {
            id: capability.clone(),
            agent_id: agent_id.into(),
            capability,
            phase: 0,
            dependencies: vec![],
            status: NodeStatus::Pending,
            retry_count: 0,
            error: None,
            output: None,
        }
    }

    /// Apply a status transition. Transitions are monotonic: terminal
    /// states absorb, and a lower-ranked status is never applied.
    pub fn advance(&mut self, status: NodeStatus) {
        if self.status.is_terminal() || status.rank() <= self.status.rank() {
            debug!(
                node = %self.id,
                from = ?self.status,
                to = ?status,
                "Ignoring non-monotonic node status transition"
            );
            return;
        }
        self.status = status;
    }

    /// Recreate this node fresh for a resumed run. This is a new node
    /// record, not a back-transition on the old one.
    pub fn reset_for_resume(&self) -> Self {
        Self::new(self.capability.clone(), self.agent_id.clone()).with_placement(
            self.phase,
            self.dependencies.clone(),
        )
    }

    pub(crate) fn with_placement(mut self, phase: u32, dependencies: Vec<String>) -> Self {
        self.phase = phase;
        self.dependencies = dependencies;
        self
    }
}
