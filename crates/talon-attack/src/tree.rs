use serde::{Deserialize, Serialize};
use uuid::Uuid;

use talon_core::types::{ExecutionOutcome, ModuleSpec};

/// Lifecycle of one attack-tree node. A node is terminal once
/// `Analyzed` or `Skipped`; `Branched` nodes own live subtrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeNodeStatus {
    Pending,
    Executed,
    Analyzed,
    Branched,
    Skipped,
}

/// Classification attached to a node after its execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeAnalysis {
    pub is_discovery: bool,
    pub is_exploit_success: bool,
    #[serde(default)]
    pub discovered_info: Vec<String>,
    #[serde(default)]
    pub search_queries: Vec<String>,
    pub reasoning: String,
}

/// One node of the attack tree: a module invocation, its raw result,
/// its classification, and the children it branched into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackTreeNode {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub depth: u32,
    pub module: ModuleSpec,
    /// Why this module was selected (root modules carry the plan's
    /// rationale; branched children carry the ranker's).
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub execution: Option<ExecutionOutcome>,
    #[serde(default)]
    pub analysis: Option<NodeAnalysis>,
    #[serde(default)]
    pub children: Vec<AttackTreeNode>,
    pub status: TreeNodeStatus,
}

impl AttackTreeNode {
    /// A root node of the initial exploitation plan.
    pub fn root(module: ModuleSpec, reasoning: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            depth: 0,
            module,
            reasoning: reasoning.into(),
            execution: None,
            analysis: None,
            children: Vec::new(),
            status: TreeNodeStatus::Pending,
        }
    }

    /// A child spawned because the parent's classified result suggested
    /// a promising next step.
    pub fn child(parent_id: &str, depth: u32, module: ModuleSpec, reasoning: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: Some(parent_id.to_string()),
            depth,
            module,
            reasoning: reasoning.into(),
            execution: None,
            analysis: None,
            children: Vec::new(),
            status: TreeNodeStatus::Pending,
        }
    }

    /// Depth-first traversal of this subtree (self first).
    pub fn walk(&self) -> Vec<&AttackTreeNode> {
        let mut nodes = vec![self];
        for child in &self.children {
            nodes.extend(child.walk());
        }
        nodes
    }
}

/// Counters accumulated across one whole tree run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TreeStats {
    pub total_executions: u32,
    pub discoveries: u32,
    pub exploit_successes: u32,
    pub skipped: u32,
    pub deepest: u32,
}

impl TreeStats {
    pub(crate) fn note_depth(&mut self, depth: u32) {
        self.deepest = self.deepest.max(depth);
    }
}

/// Final output of one tree run. The live tree is discarded once the
/// owning task completes; the report is what survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeReport {
    pub roots: Vec<AttackTreeNode>,
    pub stats: TreeStats,
}

impl TreeReport {
    /// Flatten every node of every root, depth-first.
    pub fn flatten(&self) -> Vec<&AttackTreeNode> {
        self.roots.iter().flat_map(|r| r.walk()).collect()
    }

    /// Nodes classified as successful exploits.
    pub fn successful_exploits(&self) -> Vec<&AttackTreeNode> {
        self.flatten()
            .into_iter()
            .filter(|n| {
                n.analysis
                    .as_ref()
                    .is_some_and(|a| a.is_exploit_success)
            })
            .collect()
    }
}
