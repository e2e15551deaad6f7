use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use talon_core::error::Result;
use talon_core::types::{NodeStatus, WorkflowId, WorkflowSnapshot, WorkflowStatus};

use crate::context::WorkflowContext;
use crate::graph::ExecutionGraph;

/// A workflow instantiated from a template against an operation.
///
/// Mutated exclusively by the phase scheduler; everything needed to
/// resume from the last completed phase serializes with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowId,
    pub template_id: String,
    pub operation_id: String,
    pub status: WorkflowStatus,
    pub current_phase: u32,
    pub graph: ExecutionGraph,
    pub context: WorkflowContext,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(
        template_id: impl Into<String>,
        operation_id: impl Into<String>,
        graph: ExecutionGraph,
        context: WorkflowContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            template_id: template_id.into(),
            operation_id: operation_id.into(),
            status: WorkflowStatus::Pending,
            current_phase: 0,
            graph,
            context,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fraction of nodes that have settled (terminal status), 0.0–1.0.
    pub fn progress(&self) -> f32 {
        let total = self.graph.nodes.len();
        if total == 0 {
            return 1.0;
        }
        self.graph.settled_count() as f32 / total as f32
    }

    /// Serialize into a persistable checkpoint.
    pub fn to_snapshot(&self) -> Result<WorkflowSnapshot> {
        let json = serde_json::to_string(self)?;
        Ok(WorkflowSnapshot::new(self.id.clone(), self.status, json))
    }

    /// Restore an instance from a persisted checkpoint.
    pub fn from_snapshot(snapshot: &WorkflowSnapshot) -> Result<Self> {
        Ok(serde_json::from_str(&snapshot.instance_json)?)
    }

    /// Prepare a paused or failed instance to continue forward.
    ///
    /// Failed (and defensively, still-running) nodes in the resume phase
    /// and beyond are recreated fresh; completed nodes are untouched and
    /// will be filtered out of the resume phase by the scheduler.
    pub fn prepare_resume(&mut self) {
        for node in self.graph.nodes.values_mut() {
            if node.phase >= self.current_phase
                && matches!(node.status, NodeStatus::Failed | NodeStatus::Running)
            {
                *node = node.reset_for_resume();
            }
        }
        self.status = WorkflowStatus::Running;
        self.error_message = None;
        self.updated_at = Utc::now();
    }
}
