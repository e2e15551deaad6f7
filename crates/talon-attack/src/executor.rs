use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use talon_core::audit::AuditLog;
use talon_core::config::AttackTreeConfig;
use talon_core::traits::ToolRunner;
use talon_core::types::{ExecutionOutcome, ModuleSpec, ModuleType, Target};

use crate::budget::{BudgetDecision, TreeBudget};
use crate::classify::{
    DiscoveryClassifier, ExploitClassifier, PatternDiscoveryClassifier, PatternExploitClassifier,
};
use crate::postexploit::{DefaultPostExploitPlanner, PostExploitPlanner};
use crate::rank::{KeywordModuleRanker, ModuleRanker};
use crate::search::{ModuleSearch, StaticModuleIndex};
use crate::tree::{AttackTreeNode, NodeAnalysis, TreeNodeStatus, TreeReport, TreeStats};

/// Candidates fetched per derived search query before ranking.
const CANDIDATE_POOL_PER_QUERY: usize = 25;

/// Recursive attack-tree executor.
///
/// Expands an initial exploitation plan depth-first: execute, classify,
/// branch. A parent's execution and classification always happen before
/// any of its children run, and each child's entire subtree resolves
/// before the next sibling starts. Bounding is purely structural
/// (depth, total executions, children per node), enforced by the
/// run-scoped [`TreeBudget`].
pub struct AttackTreeExecutor {
    runners: HashMap<ModuleType, Arc<dyn ToolRunner>>,
    search: Arc<dyn ModuleSearch>,
    discovery: Arc<dyn DiscoveryClassifier>,
    exploit: Arc<dyn ExploitClassifier>,
    ranker: Arc<dyn ModuleRanker>,
    planner: Arc<dyn PostExploitPlanner>,
    config: AttackTreeConfig,
    audit: AuditLog,
}

impl AttackTreeExecutor {
    /// An executor with the deterministic decision seams. AI-assisted
    /// implementations are swapped in with the `with_*` builders.
    pub fn new(config: AttackTreeConfig, audit: AuditLog) -> Self {
        Self {
            runners: HashMap::new(),
            search: Arc::new(StaticModuleIndex::default()),
            discovery: Arc::new(PatternDiscoveryClassifier),
            exploit: Arc::new(PatternExploitClassifier),
            ranker: Arc::new(KeywordModuleRanker),
            planner: Arc::new(DefaultPostExploitPlanner),
            config,
            audit,
        }
    }

    /// Register the tool runner for its module type.
    pub fn with_runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.runners.insert(runner.module_type(), runner);
        self
    }

    pub fn with_search(mut self, search: Arc<dyn ModuleSearch>) -> Self {
        self.search = search;
        self
    }

    pub fn with_discovery_classifier(mut self, classifier: Arc<dyn DiscoveryClassifier>) -> Self {
        self.discovery = classifier;
        self
    }

    pub fn with_exploit_classifier(mut self, classifier: Arc<dyn ExploitClassifier>) -> Self {
        self.exploit = classifier;
        self
    }

    pub fn with_ranker(mut self, ranker: Arc<dyn ModuleRanker>) -> Self {
        self.ranker = ranker;
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn PostExploitPlanner>) -> Self {
        self.planner = planner;
        self
    }

    /// Run the whole tree from the initial plan. Roots are visited in
    /// order; each root's subtree fully resolves before the next starts.
    pub async fn run(&self, root_modules: Vec<ModuleSpec>, target: &Target) -> TreeReport {
        let mut budget = TreeBudget::new(&self.config);
        let mut stats = TreeStats::default();
        let mut roots = Vec::new();

        info!(
            roots = root_modules.len(),
            target = %target.host,
            max_executions = self.config.max_total_executions,
            "Attack tree run started"
        );
        self.audit.info(
            "attack tree started",
            serde_json::json!({
                "target": target.host,
                "roots": root_modules.iter().map(|m| m.visit_key()).collect::<Vec<_>>(),
            }),
        );

        for module in root_modules {
            let node = AttackTreeNode::root(module, "initial exploitation plan");
            let node = self
                .execute_node(node, target, &mut budget, &mut stats)
                .await;
            roots.push(node);
        }

        stats.total_executions = budget.executed();
        self.audit.info(
            "attack tree completed",
            serde_json::json!({
                "target": target.host,
                "total_executions": stats.total_executions,
                "discoveries": stats.discoveries,
                "exploit_successes": stats.exploit_successes,
                "skipped": stats.skipped,
            }),
        );
        TreeReport { roots, stats }
    }

    /// Execute one node and, depending on its classification, its
    /// subtree. Runner failures are captured on the node itself so
    /// sibling branches are unaffected.
    fn execute_node<'a>(
        &'a self,
        mut node: AttackTreeNode,
        target: &'a Target,
        budget: &'a mut TreeBudget,
        stats: &'a mut TreeStats,
    ) -> BoxFuture<'a, AttackTreeNode> {
        Box::pin(async move {
            match budget.evaluate(&node.module, node.depth) {
                BudgetDecision::Run => {}
                decision => {
                    debug!(
                        module = %node.module.visit_key(),
                        depth = node.depth,
                        reason = decision.reason(),
                        "Node skipped"
                    );
                    self.audit.info(
                        "node skipped",
                        serde_json::json!({
                            "module": node.module.visit_key(),
                            "depth": node.depth,
                            "reason": decision.reason(),
                        }),
                    );
                    node.status = TreeNodeStatus::Skipped;
                    stats.skipped += 1;
                    return node;
                }
            }

            budget.claim(&node.module);
            stats.note_depth(node.depth);

            let outcome = self.run_module(&node.module, target).await;
            self.audit.info(
                "module executed",
                serde_json::json!({
                    "module": node.module.visit_key(),
                    "depth": node.depth,
                    "success": outcome.success,
                    "exit_code": outcome.exit_code,
                    "duration_ms": outcome.duration_ms,
                }),
            );
            node.execution = Some(outcome.clone());
            node.status = TreeNodeStatus::Executed;

            match node.module.module_type {
                ModuleType::Auxiliary | ModuleType::Post => {
                    self.branch_discovery(&mut node, outcome, target, budget, stats)
                        .await;
                }
                ModuleType::Exploit => {
                    self.branch_exploit(&mut node, outcome, target, budget, stats)
                        .await;
                }
            }

            node.status = if node.children.is_empty() {
                TreeNodeStatus::Analyzed
            } else {
                TreeNodeStatus::Branched
            };
            node
        })
    }

    /// Execute the module through the runner for its type, bounded by
    /// the runner's timeout. Any error becomes a failed outcome.
    async fn run_module(&self, module: &ModuleSpec, target: &Target) -> ExecutionOutcome {
        let Some(runner) = self.runners.get(&module.module_type) else {
            warn!(module = %module.visit_key(), "No runner for module type");
            return ExecutionOutcome::failure(
                format!("no runner registered for type '{}'", module.module_type),
                -1,
            );
        };

        let timeout = Duration::from_secs(runner.timeout_secs());
        match tokio::time::timeout(timeout, runner.execute(module.clone(), target.clone())).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(module = %module.visit_key(), error = %e, "Module execution failed");
                ExecutionOutcome::failure(e.to_string(), -1)
            }
            Err(_) => {
                warn!(module = %module.visit_key(), timeout_secs = runner.timeout_secs(), "Module execution timed out");
                ExecutionOutcome::failure(
                    format!("timeout after {}s", runner.timeout_secs()),
                    -1,
                )
            }
        }
    }

    /// Auxiliary/post path: classify for discovery, derive queries,
    /// gather and rank candidates, recurse into the selected children.
    async fn branch_discovery(
        &self,
        node: &mut AttackTreeNode,
        outcome: ExecutionOutcome,
        target: &Target,
        budget: &mut TreeBudget,
        stats: &mut TreeStats,
    ) {
        let analysis = match self
            .discovery
            .classify(node.module.clone(), outcome.clone())
            .await
        {
            Ok(analysis) => analysis,
            Err(e) => {
                // Classifier implementations fall back internally; an
                // error here means even the fallback was unreachable.
                warn!(module = %node.module.path, error = %e, "Discovery classification unavailable");
                PatternDiscoveryClassifier::analyze(&outcome.output)
            }
        };
        self.audit.info(
            "node classified",
            serde_json::json!({
                "module": node.module.visit_key(),
                "is_discovery": analysis.is_discovery,
                "queries": analysis.search_queries,
            }),
        );

        if analysis.is_discovery {
            stats.discoveries += 1;

            // Candidate pool, deduplicated against the visited set and
            // within itself
            let mut seen: HashSet<String> = HashSet::new();
            let mut pool: Vec<ModuleSpec> = Vec::new();
            for query in &analysis.search_queries {
                match self
                    .search
                    .search(query.clone(), CANDIDATE_POOL_PER_QUERY)
                    .await
                {
                    Ok(found) => {
                        for candidate in found {
                            let key = candidate.visit_key();
                            if budget.is_visited(&candidate) || !seen.insert(key) {
                                continue;
                            }
                            pool.push(candidate);
                        }
                    }
                    Err(e) => {
                        warn!(query = %query, error = %e, "Module search failed");
                    }
                }
            }

            if !pool.is_empty() {
                let ranked = match self
                    .ranker
                    .rank(analysis.clone(), pool, self.config.max_children_per_node)
                    .await
                {
                    Ok(ranked) => ranked,
                    Err(e) => {
                        warn!(error = %e, "Module ranking unavailable");
                        Vec::new()
                    }
                };

                for selection in ranked {
                    let child = AttackTreeNode::child(
                        &node.id,
                        node.depth + 1,
                        selection.module,
                        selection.reasoning,
                    );
                    let child = self.execute_node(child, target, budget, stats).await;
                    node.children.push(child);
                }
            }
        }

        node.analysis = Some(NodeAnalysis {
            is_discovery: analysis.is_discovery,
            is_exploit_success: false,
            discovered_info: analysis.discovered_info,
            search_queries: analysis.search_queries,
            reasoning: analysis.reasoning,
        });
    }

    /// Exploit path: classify for success, derive post-exploitation
    /// children.
    async fn branch_exploit(
        &self,
        node: &mut AttackTreeNode,
        outcome: ExecutionOutcome,
        target: &Target,
        budget: &mut TreeBudget,
        stats: &mut TreeStats,
    ) {
        let analysis = match self
            .exploit
            .classify(node.module.clone(), outcome.clone())
            .await
        {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(module = %node.module.path, error = %e, "Exploit classification unavailable");
                PatternExploitClassifier::analyze(&outcome.output)
            }
        };
        self.audit.info(
            "node classified",
            serde_json::json!({
                "module": node.module.visit_key(),
                "is_exploit_success": analysis.is_success,
                "evidence": analysis.evidence,
            }),
        );

        if analysis.is_success {
            stats.exploit_successes += 1;

            let planned = match self
                .planner
                .plan(
                    node.module.clone(),
                    outcome,
                    self.config.max_post_exploit_scans,
                )
                .await
            {
                Ok(planned) => planned,
                Err(e) => {
                    warn!(error = %e, "Post-exploit planning unavailable");
                    DefaultPostExploitPlanner::default_set(self.config.max_post_exploit_scans)
                }
            };

            for plan in planned {
                let child =
                    AttackTreeNode::child(&node.id, node.depth + 1, plan.module, plan.reasoning);
                let child = self.execute_node(child, target, budget, stats).await;
                node.children.push(child);
            }
        }

        node.analysis = Some(NodeAnalysis {
            is_discovery: false,
            is_exploit_success: analysis.is_success,
            discovered_info: Vec::new(),
            search_queries: Vec::new(),
            reasoning: analysis.reasoning,
        });
    }
}
