use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use talon_core::audit::AuditLog;
use talon_core::config::RetryPolicy;
use talon_core::error::{Result, TalonError};
use talon_core::traits::WorkflowStore;
use talon_core::types::{FallbackBehavior, NodeStatus, WorkflowId, WorkflowStatus};

use crate::graph::ResolvedNode;
use crate::handler::{HandlerInput, HandlerRegistry};
use crate::instance::WorkflowInstance;

/// Pause/cancel signals shared between the manager and one scheduler run.
///
/// Both signals are observed at phase boundaries only; a node already
/// executing is never interrupted.
#[derive(Default)]
pub struct WorkflowControl {
    cancel: CancellationToken,
    pause: AtomicBool,
}

impl WorkflowControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Result of one node's bounded-retry execution.
struct NodeRun {
    node_id: String,
    status: NodeStatus,
    output: Option<serde_json::Value>,
    retry_count: u32,
    error: Option<String>,
}

/// Drives a workflow instance through its phases.
///
/// Every node of a phase runs concurrently, and the phase is a barrier:
/// the next phase starts only after all nodes settle. Failures are
/// collected, not fail-fast, and handled per the configured fallback
/// behavior after the barrier.
pub struct PhaseScheduler {
    handlers: Arc<HandlerRegistry>,
    store: Arc<dyn WorkflowStore>,
    audit: AuditLog,
    retry: RetryPolicy,
    fallback: FallbackBehavior,
}

impl PhaseScheduler {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        store: Arc<dyn WorkflowStore>,
        audit: AuditLog,
        retry: RetryPolicy,
        fallback: FallbackBehavior,
    ) -> Self {
        Self {
            handlers,
            store,
            audit,
            retry,
            fallback,
        }
    }

    /// Run the instance forward from its current phase until it settles
    /// in a terminal status or a pause/cancel request is honored.
    ///
    /// Resume is the same entry point: completed capabilities are
    /// filtered out of the first phase, so finished work never re-runs.
    pub async fn run(
        &self,
        instance: &mut WorkflowInstance,
        control: &WorkflowControl,
    ) -> Result<()> {
        let workflow_id = instance.id.clone();
        instance.status = WorkflowStatus::Running;
        self.audit.info(
            "workflow running",
            serde_json::json!({
                "workflow_id": workflow_id.0,
                "template_id": instance.template_id,
                "phase": instance.current_phase,
            }),
        );
        self.checkpoint(instance).await?;

        let total_phases = instance.graph.phase_count();
        while instance.current_phase < total_phases {
            if control.is_cancelled() {
                instance.status = WorkflowStatus::Cancelled;
                self.audit.info(
                    "workflow cancelled",
                    serde_json::json!({"workflow_id": workflow_id.0, "phase": instance.current_phase}),
                );
                self.checkpoint(instance).await?;
                return Ok(());
            }
            if control.pause_requested() {
                instance.status = WorkflowStatus::Paused;
                self.audit.info(
                    "workflow paused",
                    serde_json::json!({"workflow_id": workflow_id.0, "phase": instance.current_phase}),
                );
                self.checkpoint(instance).await?;
                return Ok(());
            }

            let phase = instance.current_phase;
            let completed = instance.graph.completed_capabilities();
            let pending: Vec<ResolvedNode> = instance
                .graph
                .nodes_in_phase(phase)
                .into_iter()
                .filter(|n| !completed.contains(&n.capability))
                .cloned()
                .collect();

            info!(
                workflow_id = %workflow_id,
                phase,
                nodes = pending.len(),
                "Phase started"
            );
            self.audit.info(
                "phase started",
                serde_json::json!({
                    "workflow_id": workflow_id.0,
                    "phase": phase,
                    "nodes": pending.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(),
                }),
            );

            for node in &pending {
                if let Some(node) = instance.graph.node_mut(&node.id) {
                    node.advance(NodeStatus::Running);
                }
            }

            // Every node of the phase observes the same context view:
            // base data plus overlays produced by earlier phases
            let view = instance.context.view_before_phase(phase);

            let runs = futures::future::join_all(
                pending
                    .iter()
                    .map(|node| self.run_node(workflow_id.clone(), node.clone(), view.clone())),
            )
            .await;

            let mut outputs = Vec::new();
            let mut failures: Vec<(String, String)> = Vec::new();
            for run in runs {
                if let Some(node) = instance.graph.node_mut(&run.node_id) {
                    node.retry_count = run.retry_count;
                    node.error = run.error.clone();
                    node.output = run.output.clone();
                    node.advance(run.status);
                }
                match run.status {
                    NodeStatus::Completed => outputs.push((
                        run.node_id.clone(),
                        run.output.unwrap_or(serde_json::Value::Null),
                    )),
                    NodeStatus::Failed => failures.push((
                        run.node_id,
                        run.error.unwrap_or_else(|| "unknown error".into()),
                    )),
                    _ => {}
                }
            }

            instance.context.apply_phase(phase, outputs);

            if !failures.is_empty() {
                match self.fallback {
                    FallbackBehavior::Fail => {
                        let (node, error) = &failures[0];
                        let message = format!("Node '{}' failed: {}", node, error);
                        error!(workflow_id = %workflow_id, node = %node, "Workflow aborted");
                        instance.status = WorkflowStatus::Failed;
                        instance.error_message = Some(message.clone());
                        self.audit.error(
                            "workflow failed",
                            serde_json::json!({
                                "workflow_id": workflow_id.0,
                                "phase": phase,
                                "error": message,
                            }),
                        );
                        self.checkpoint(instance).await?;
                        return Ok(());
                    }
                    FallbackBehavior::Skip | FallbackBehavior::Substitute => {
                        // Substitute is reserved for a fallback-agent
                        // strategy and currently behaves as Skip.
                        warn!(
                            workflow_id = %workflow_id,
                            phase,
                            failed = failures.len(),
                            "Continuing past node failures"
                        );
                        self.audit.warn(
                            "phase continued past failures",
                            serde_json::json!({
                                "workflow_id": workflow_id.0,
                                "phase": phase,
                                "failed_nodes": failures.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
                                "fallback": self.fallback,
                            }),
                        );
                    }
                }
            }

            self.audit.info(
                "phase completed",
                serde_json::json!({"workflow_id": workflow_id.0, "phase": phase}),
            );
            instance.current_phase += 1;
            self.checkpoint(instance).await?;
        }

        instance.status = WorkflowStatus::Completed;
        self.audit.info(
            "workflow completed",
            serde_json::json!({"workflow_id": workflow_id.0}),
        );
        self.checkpoint(instance).await?;
        Ok(())
    }

    /// Execute one node with bounded retry and exponential backoff.
    ///
    /// Configuration errors (no handler registered) are not retried; any
    /// other failure consumes an attempt until `max_retries` retries are
    /// spent.
    async fn run_node(
        &self,
        workflow_id: WorkflowId,
        node: ResolvedNode,
        view: HashMap<String, serde_json::Value>,
    ) -> NodeRun {
        let max_attempts = self.retry.max_retries + 1;
        let started = Instant::now();
        let mut attempts: u32 = 0;

        self.audit.info(
            "node started",
            serde_json::json!({
                "workflow_id": workflow_id.0,
                "node": node.id,
                "agent_id": node.agent_id,
                "phase": node.phase,
            }),
        );

        loop {
            attempts += 1;
            let input = HandlerInput {
                workflow_id: workflow_id.clone(),
                agent_id: node.agent_id.clone(),
                capability: node.capability.clone(),
                context: view.clone(),
            };

            match self.handlers.execute(&node.capability, input).await {
                Ok(output) => {
                    debug!(
                        node = %node.id,
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Node completed"
                    );
                    self.audit.info(
                        "node completed",
                        serde_json::json!({
                            "workflow_id": workflow_id.0,
                            "node": node.id,
                            "agent_id": node.agent_id,
                            "retries": attempts - 1,
                        }),
                    );
                    return NodeRun {
                        node_id: node.id,
                        status: NodeStatus::Completed,
                        output: Some(output),
                        retry_count: attempts - 1,
                        error: None,
                    };
                }
                Err(e) => {
                    let retryable = !matches!(e, TalonError::Config(_));
                    if retryable && attempts < max_attempts {
                        let delay = self.retry.delay_for(attempts);
                        warn!(
                            node = %node.id,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Node failed, retrying"
                        );
                        self.audit.warn(
                            "node retry scheduled",
                            serde_json::json!({
                                "workflow_id": workflow_id.0,
                                "node": node.id,
                                "attempt": attempts,
                                "delay_ms": delay.as_millis() as u64,
                            }),
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    error!(node = %node.id, attempts, error = %e, "Node failed");
                    self.audit.error(
                        "node failed",
                        serde_json::json!({
                            "workflow_id": workflow_id.0,
                            "node": node.id,
                            "agent_id": node.agent_id,
                            "attempts": attempts,
                            "error": e.to_string(),
                        }),
                    );
                    return NodeRun {
                        node_id: node.id,
                        status: NodeStatus::Failed,
                        output: None,
                        retry_count: attempts - 1,
                        error: Some(e.to_string()),
                    };
                }
            }
        }
    }

    /// Persist the instance. An error is surfaced to the caller, since
    /// the checkpoint may not have been durably saved.
    async fn checkpoint(&self, instance: &WorkflowInstance) -> Result<()> {
        let snapshot = instance.to_snapshot()?;
        if let Err(e) = self.store.save(snapshot).await {
            error!(workflow_id = %instance.id, error = %e, "Checkpoint write failed");
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicU32;

    use talon_core::condition::EvalContext;
    use talon_core::types::Dependency;
    use talon_store::SqliteStore;

    use crate::context::WorkflowContext;
    use crate::graph::GraphBuilder;
    use crate::handler::CapabilityHandler;

    /// Succeeds after a configurable number of failures, counting calls.
    struct CountingHandler {
        capability: String,
        fail_times: u32,
        calls: Arc<AtomicU32>,
        output: serde_json::Value,
    }

    impl CountingHandler {
        fn new(capability: &str, fail_times: u32, output: serde_json::Value) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Self {
                    capability: capability.to_string(),
                    fail_times,
                    calls: calls.clone(),
                    output,
                },
                calls,
            )
        }
    }

    impl CapabilityHandler for CountingHandler {
        fn capability(&self) -> &str {
            &self.capability
        }

        fn execute(&self, _input: HandlerInput) -> BoxFuture<'_, Result<serde_json::Value>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < self.fail_times {
                    Err(TalonError::Provider("synthetic failure".into()))
                } else {
                    Ok(self.output.clone())
                }
            })
        }
    }

    /// Requests a pause on the shared control while executing.
    struct PausingHandler {
        capability: String,
        control: Arc<WorkflowControl>,
        calls: Arc<AtomicU32>,
    }

    impl CapabilityHandler for PausingHandler {
        fn capability(&self) -> &str {
            &self.capability
        }

        fn execute(&self, _input: HandlerInput) -> BoxFuture<'_, Result<serde_json::Value>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.control.request_pause();
                Ok(serde_json::json!("paused-after-me"))
            })
        }
    }

    /// Echoes a context key so downstream assertions can see data flow.
    struct EchoContextHandler {
        capability: String,
        reads: String,
    }

    impl CapabilityHandler for EchoContextHandler {
        fn capability(&self) -> &str {
            &self.capability
        }

        fn execute(&self, input: HandlerInput) -> BoxFuture<'_, Result<serde_json::Value>> {
            Box::pin(async move {
                Ok(input
                    .context
                    .get(&self.reads)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null))
            })
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
            backoff_multiplier: 1.0,
            max_delay_ms: 2,
        }
    }

    fn instance_with(caps: &[(&str, &str)], deps: Vec<Dependency>) -> WorkflowInstance {
        let nodes = caps
            .iter()
            .map(|(cap, agent)| crate::graph::ResolvedNode::new(*cap, *agent))
            .collect();
        let context = HashMap::new();
        let available = HashSet::new();
        let eval = EvalContext {
            context: &context,
            available_capabilities: &available,
        };
        let graph = GraphBuilder::build(nodes, &deps, &eval).unwrap();
        WorkflowInstance::new("tmpl", "op", graph, WorkflowContext::new())
    }

    fn scheduler(
        handlers: HandlerRegistry,
        retry: RetryPolicy,
        fallback: FallbackBehavior,
    ) -> (PhaseScheduler, Arc<talon_core::audit::MemorySink>) {
        let (audit, sink) = AuditLog::in_memory();
        let store: Arc<dyn WorkflowStore> = Arc::new(SqliteStore::in_memory().unwrap());
        (
            PhaseScheduler::new(Arc::new(handlers), store, audit, retry, fallback),
            sink,
        )
    }

    #[tokio::test]
    async fn test_two_phase_data_flow() {
        let mut handlers = HandlerRegistry::new();
        let (recon, _) = CountingHandler::new("recon", 0, serde_json::json!("smb open"));
        handlers.register(recon);
        handlers.register(EchoContextHandler {
            capability: "exploit".into(),
            reads: "recon".into(),
        });

        let mut instance = instance_with(
            &[("recon", "agent_a"), ("exploit", "agent_b")],
            vec![Dependency::required("agent_b", "recon")],
        );
        let (scheduler, _) = scheduler(handlers, fast_retry(0), FallbackBehavior::Skip);

        scheduler
            .run(&mut instance, &WorkflowControl::new())
            .await
            .unwrap();

        assert_eq!(instance.status, WorkflowStatus::Completed);
        // Phase-1 node observed phase-0 output through the context
        assert_eq!(
            instance.context.get("exploit"),
            Some(&serde_json::json!("smb open"))
        );
        assert_eq!(instance.progress(), 1.0);
    }

    #[tokio::test]
    async fn test_retry_then_success_records_count() {
        let max_retries = 3;
        let mut handlers = HandlerRegistry::new();
        let (handler, calls) =
            CountingHandler::new("flaky", max_retries - 1, serde_json::json!("ok"));
        handlers.register(handler);

        let mut instance = instance_with(&[("flaky", "agent_a")], vec![]);
        let (scheduler, _) = scheduler(handlers, fast_retry(max_retries), FallbackBehavior::Fail);

        scheduler
            .run(&mut instance, &WorkflowControl::new())
            .await
            .unwrap();

        assert_eq!(instance.status, WorkflowStatus::Completed);
        let node = instance.graph.node("flaky").unwrap();
        assert_eq!(node.status, NodeStatus::Completed);
        assert_eq!(node.retry_count, max_retries - 1);
        assert_eq!(calls.load(Ordering::SeqCst), max_retries);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fail_aborts_workflow() {
        let mut handlers = HandlerRegistry::new();
        let (handler, calls) = CountingHandler::new("doomed", 99, serde_json::json!(null));
        handlers.register(handler);
        let (later, later_calls) = CountingHandler::new("later", 0, serde_json::json!("ok"));
        handlers.register(later);

        let mut instance = instance_with(
            &[("doomed", "agent_a"), ("later", "agent_b")],
            vec![Dependency::required("agent_b", "doomed")],
        );
        let (scheduler, sink) = scheduler(handlers, fast_retry(2), FallbackBehavior::Fail);

        scheduler
            .run(&mut instance, &WorkflowControl::new())
            .await
            .unwrap();

        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert!(instance.error_message.as_deref().unwrap().contains("doomed"));
        let node = instance.graph.node("doomed").unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        assert_eq!(node.retry_count, 2);
        // max_retries + 1 attempts total
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Downstream phase never started
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
        assert!(sink.messages().contains(&"workflow failed".to_string()));
    }

    #[tokio::test]
    async fn test_skip_fallback_continues() {
        let mut handlers = HandlerRegistry::new();
        let (doomed, _) = CountingHandler::new("doomed", 99, serde_json::json!(null));
        handlers.register(doomed);
        let (peer, peer_calls) = CountingHandler::new("peer", 0, serde_json::json!("fine"));
        handlers.register(peer);
        let (later, later_calls) = CountingHandler::new("later", 0, serde_json::json!("ran"));
        handlers.register(later);

        let mut instance = instance_with(
            &[
                ("doomed", "agent_a"),
                ("peer", "agent_b"),
                ("later", "agent_c"),
            ],
            vec![Dependency::required("agent_c", "peer")],
        );
        let (scheduler, _) = scheduler(handlers, fast_retry(0), FallbackBehavior::Skip);

        scheduler
            .run(&mut instance, &WorkflowControl::new())
            .await
            .unwrap();

        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert_eq!(
            instance.graph.node("doomed").unwrap().status,
            NodeStatus::Failed
        );
        assert_eq!(peer_calls.load(Ordering::SeqCst), 1);
        assert_eq!(later_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_observed_at_boundary() {
        let mut handlers = HandlerRegistry::new();
        let (handler, calls) = CountingHandler::new("recon", 0, serde_json::json!("x"));
        handlers.register(handler);

        let mut instance = instance_with(&[("recon", "agent_a")], vec![]);
        let (scheduler, _) = scheduler(handlers, fast_retry(0), FallbackBehavior::Skip);

        let control = WorkflowControl::new();
        control.cancel();
        scheduler.run(&mut instance, &control).await.unwrap();

        assert_eq!(instance.status, WorkflowStatus::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pause_then_resume_no_reexecution() {
        let control = Arc::new(WorkflowControl::new());
        let phase0_calls = Arc::new(AtomicU32::new(0));

        let mut handlers = HandlerRegistry::new();
        handlers.register(PausingHandler {
            capability: "recon".into(),
            control: control.clone(),
            calls: phase0_calls.clone(),
        });
        handlers.register(EchoContextHandler {
            capability: "exploit".into(),
            reads: "recon".into(),
        });

        let mut instance = instance_with(
            &[("recon", "agent_a"), ("exploit", "agent_b")],
            vec![Dependency::required("agent_b", "recon")],
        );
        let (scheduler, _) = scheduler(handlers, fast_retry(0), FallbackBehavior::Fail);

        // First run: phase 0 completes, pause lands before phase 1
        scheduler.run(&mut instance, &control).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Paused);
        assert_eq!(instance.current_phase, 1);
        assert_eq!(phase0_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            instance.context.get("recon"),
            Some(&serde_json::json!("paused-after-me"))
        );

        // Resume with a fresh control: phase 0 is not re-executed
        instance.prepare_resume();
        scheduler
            .run(&mut instance, &WorkflowControl::new())
            .await
            .unwrap();
        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert_eq!(phase0_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            instance.context.get("exploit"),
            Some(&serde_json::json!("paused-after-me"))
        );
    }

    #[tokio::test]
    async fn test_missing_handler_fails_without_retries() {
        let handlers = HandlerRegistry::new();
        let mut instance = instance_with(&[("ghost", "agent_a")], vec![]);
        let (scheduler, _) = scheduler(handlers, fast_retry(5), FallbackBehavior::Skip);

        scheduler
            .run(&mut instance, &WorkflowControl::new())
            .await
            .unwrap();

        let node = instance.graph.node("ghost").unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        // Config errors consume a single attempt
        assert_eq!(node.retry_count, 0);
    }

    #[tokio::test]
    async fn test_empty_graph_completes() {
        let handlers = HandlerRegistry::new();
        let mut instance = instance_with(&[], vec![]);
        let (scheduler, _) = scheduler(handlers, fast_retry(0), FallbackBehavior::Fail);

        scheduler
            .run(&mut instance, &WorkflowControl::new())
            .await
            .unwrap();
        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert_eq!(instance.progress(), 1.0);
    }
}
