use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use talon_core::condition::{evaluate_opt, EvalContext};
use talon_core::error::{Result, TalonError};
use talon_core::types::{Dependency, DependencyKind, NodeStatus};

use super::node::ResolvedNode;
use crate::registry::RegistrySnapshot;

/// Result of resolving a capability set against the registry.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// One node per resolved capability, placement not yet assigned.
    pub nodes: Vec<ResolvedNode>,
    /// Required capabilities with no available agent.
    pub missing: Vec<String>,
}

/// A directed edge: `from`'s output feeds `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

/// A dependency row dropped because its condition evaluated false.
/// Recorded for the audit trail, never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedDependency {
    pub agent_id: String,
    pub depends_on: String,
    pub kind: DependencyKind,
}

/// The phase-partitioned execution graph. Invariant: acyclic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionGraph {
    pub nodes: HashMap<String, ResolvedNode>,
    pub edges: Vec<GraphEdge>,
    #[serde(default)]
    pub skipped_dependencies: Vec<SkippedDependency>,
}

impl ExecutionGraph {
    /// Number of phases (0 for an empty graph).
    pub fn phase_count(&self) -> u32 {
        self.nodes
            .values()
            .map(|n| n.phase + 1)
            .max()
            .unwrap_or(0)
    }

    /// Nodes scheduled for one phase, sorted by id for deterministic
    /// iteration.
    pub fn nodes_in_phase(&self, phase: u32) -> Vec<&ResolvedNode> {
        let mut nodes: Vec<&ResolvedNode> =
            self.nodes.values().filter(|n| n.phase == phase).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn node(&self, id: &str) -> Option<&ResolvedNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut ResolvedNode> {
        self.nodes.get_mut(id)
    }

    /// Count of nodes in a terminal status.
    pub fn settled_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.status.is_terminal())
            .count()
    }

    /// Completed capability names (used to skip work on resume).
    pub fn completed_capabilities(&self) -> BTreeSet<String> {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Completed)
            .map(|n| n.capability.clone())
            .collect()
    }
}

/// Builds execution graphs from declared capabilities and dependencies.
pub struct GraphBuilder;

impl GraphBuilder {
    /// Resolve required and optional capabilities to concrete agents.
    ///
    /// Each required capability missing an available agent is recorded in
    /// `missing`; an absent optional capability is dropped silently.
    pub fn resolve(
        required: &[String],
        optional: &[String],
        snapshot: &RegistrySnapshot,
    ) -> Resolution {
        let mut resolution = Resolution::default();

        for capability in required {
            match snapshot.best_agent(capability) {
                Some(offer) => {
                    resolution
                        .nodes
                        .push(ResolvedNode::new(capability.clone(), offer.agent_id.clone()));
                }
                None => {
                    warn!(capability = %capability, "No available agent for required capability");
                    resolution.missing.push(capability.clone());
                }
            }
        }

        for capability in optional {
            match snapshot.best_agent(capability) {
                Some(offer) => {
                    resolution
                        .nodes
                        .push(ResolvedNode::new(capability.clone(), offer.agent_id.clone()));
                }
                None => {
                    debug!(capability = %capability, "Optional capability unavailable, omitted");
                }
            }
        }

        resolution
    }

    /// Build the phase-partitioned graph.
    ///
    /// Dependency rows targeting capabilities or agents not present among
    /// the resolved nodes are ignored. `Required` rows always contribute
    /// an edge; `Optional`/`Conditional` rows contribute one only when
    /// their condition evaluates true (an absent condition is true).
    /// Conflicting rows for the same edge resolve most-permissive: an
    /// included edge is never removed by another row evaluating false.
    ///
    /// A dependency cycle aborts construction; no partial graph is
    /// returned.
    pub fn build(
        nodes: Vec<ResolvedNode>,
        dependencies: &[Dependency],
        eval: &EvalContext<'_>,
    ) -> Result<ExecutionGraph> {
        // capability name -> node id (ids are capability names)
        let capability_ids: BTreeSet<String> = nodes.iter().map(|n| n.id.clone()).collect();
        // agent id -> node ids for that agent
        let mut agent_nodes: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &nodes {
            agent_nodes
                .entry(node.agent_id.as_str())
                .or_default()
                .push(node.id.as_str());
        }

        let mut edges: BTreeSet<(String, String)> = BTreeSet::new();
        let mut skipped = Vec::new();

        for dep in dependencies {
            let Some(dependents) = agent_nodes.get(dep.agent_id.as_str()) else {
                continue; // dependency of an agent not in this graph
            };
            if !capability_ids.contains(&dep.depends_on) {
                debug!(
                    agent = %dep.agent_id,
                    depends_on = %dep.depends_on,
                    "Dependency targets a capability not in this graph, ignored"
                );
                continue;
            }

            let included = match dep.kind {
                DependencyKind::Required => true,
                DependencyKind::Optional | DependencyKind::Conditional => {
                    evaluate_opt(dep.condition.as_ref(), eval)
                }
            };

            if !included {
                debug!(
                    agent = %dep.agent_id,
                    depends_on = %dep.depends_on,
                    kind = ?dep.kind,
                    "Dependency condition false, edge skipped"
                );
                skipped.push(SkippedDependency {
                    agent_id: dep.agent_id.clone(),
                    depends_on: dep.depends_on.clone(),
                    kind: dep.kind,
                });
                continue;
            }

            for dependent in dependents {
                if *dependent == dep.depends_on {
                    continue; // self-edge carries no ordering information
                }
                edges.insert((dep.depends_on.clone(), dependent.to_string()));
            }
        }

        // deps_of[node] = nodes it waits on
        let mut deps_of: HashMap<&str, Vec<&str>> = HashMap::new();
        for (from, to) in &edges {
            deps_of.entry(to.as_str()).or_default().push(from.as_str());
        }

        // Memoized depth-first phase assignment with cycle detection
        let mut memo: HashMap<String, VisitState> = HashMap::new();
        let mut phases: HashMap<String, u32> = HashMap::new();
        for node in &nodes {
            let phase = assign_phase(&node.id, &deps_of, &mut memo)?;
            phases.insert(node.id.clone(), phase);
        }

        let graph_edges: Vec<GraphEdge> = edges
            .iter()
            .map(|(from, to)| GraphEdge {
                from: from.clone(),
                to: to.clone(),
            })
            .collect();

        let nodes: HashMap<String, ResolvedNode> = nodes
            .into_iter()
            .map(|node| {
                let phase = phases.get(&node.id).copied().unwrap_or(0);
                let dependencies = deps_of
                    .get(node.id.as_str())
                    .map(|deps| deps.iter().map(|d| d.to_string()).collect())
                    .unwrap_or_default();
                let id = node.id.clone();
                (id, node.with_placement(phase, dependencies))
            })
            .collect();

        debug!(
            nodes = nodes.len(),
            edges = graph_edges.len(),
            skipped = skipped.len(),
            "Execution graph built"
        );

        Ok(ExecutionGraph {
            nodes,
            edges: graph_edges,
            skipped_dependencies: skipped,
        })
    }
}

#[derive(Clone, Copy)]
enum VisitState {
    Visiting,
    Done(u32),
}

fn assign_phase(
    id: &str,
    deps_of: &HashMap<&str, Vec<&str>>,
    memo: &mut HashMap<String, VisitState>,
) -> Result<u32> {
    match memo.get(id) {
        Some(VisitState::Done(phase)) => return Ok(*phase),
        Some(VisitState::Visiting) => {
            return Err(TalonError::CycleDetected {
                node: id.to_string(),
            })
        }
        None => {}
    }

    memo.insert(id.to_string(), VisitState::Visiting);

    let mut phase = 0;
    if let Some(deps) = deps_of.get(id) {
        for dep in deps {
            phase = phase.max(1 + assign_phase(dep, deps_of, memo)?);
        }
    }

    memo.insert(id.to_string(), VisitState::Done(phase));
    Ok(phase)
}
