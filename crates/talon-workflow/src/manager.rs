use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use talon_core::audit::AuditLog;
use talon_core::condition::EvalContext;
use talon_core::config::RetryPolicy;
use talon_core::error::{Result, TalonError};
use talon_core::traits::WorkflowStore;
use talon_core::types::{FallbackBehavior, WorkflowId, WorkflowStatus};

use crate::context::WorkflowContext;
use crate::graph::GraphBuilder;
use crate::handler::HandlerRegistry;
use crate::instance::WorkflowInstance;
use crate::registry::CapabilityRegistry;
use crate::scheduler::{PhaseScheduler, WorkflowControl};

/// A reusable workflow definition instantiated per operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub optional_capabilities: Vec<String>,
    #[serde(default)]
    pub fallback_behavior: FallbackBehavior,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl WorkflowTemplate {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            required_capabilities: vec![],
            optional_capabilities: vec![],
            fallback_behavior: FallbackBehavior::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn require(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    pub fn optional(mut self, capability: impl Into<String>) -> Self {
        self.optional_capabilities.push(capability.into());
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackBehavior) -> Self {
        self.fallback_behavior = fallback;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Caller-facing status report for one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub status: WorkflowStatus,
    /// Fraction of nodes settled, 0.0–1.0.
    pub progress: f32,
    pub current_phase: u32,
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

struct RunningWorkflow {
    control: Arc<WorkflowControl>,
    handle: tokio::task::JoinHandle<()>,
}

/// Control surface over workflow execution.
///
/// Owns the template registry and the table of live scheduler tasks.
/// Status queries read the persisted checkpoint, so they see exactly
/// what would survive a crash.
pub struct WorkflowManager {
    registry: Arc<CapabilityRegistry>,
    handlers: Arc<HandlerRegistry>,
    store: Arc<dyn WorkflowStore>,
    audit: AuditLog,
    templates: RwLock<HashMap<String, WorkflowTemplate>>,
    running: Mutex<HashMap<WorkflowId, RunningWorkflow>>,
}

impl WorkflowManager {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        handlers: Arc<HandlerRegistry>,
        store: Arc<dyn WorkflowStore>,
        audit: AuditLog,
    ) -> Self {
        Self {
            registry,
            handlers,
            store,
            audit,
            templates: RwLock::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Register a template, replacing any previous one with the same id.
    pub fn register_template(&self, template: WorkflowTemplate) {
        if let Ok(mut templates) = self.templates.write() {
            templates.insert(template.id.clone(), template);
        }
    }

    fn template(&self, template_id: &str) -> Result<WorkflowTemplate> {
        self.templates
            .read()
            .ok()
            .and_then(|templates| templates.get(template_id).cloned())
            .ok_or_else(|| TalonError::Config(format!("Template '{}' not found", template_id)))
    }

    /// Instantiate a template against an operation and start executing.
    ///
    /// Capability resolution and graph construction happen here, before
    /// anything runs: a missing required capability aborts under the
    /// `Fail` fallback, and a dependency cycle always aborts.
    pub async fn start(
        &self,
        template_id: &str,
        operation_id: &str,
        initial_context: HashMap<String, serde_json::Value>,
    ) -> Result<WorkflowId> {
        let template = self.template(template_id)?;
        let snapshot = self.registry.snapshot();

        let resolution = GraphBuilder::resolve(
            &template.required_capabilities,
            &template.optional_capabilities,
            &snapshot,
        );
        if !resolution.missing.is_empty() {
            match template.fallback_behavior {
                FallbackBehavior::Fail => {
                    return Err(TalonError::CapabilityResolution {
                        capability: resolution.missing[0].clone(),
                    });
                }
                FallbackBehavior::Skip | FallbackBehavior::Substitute => {
                    warn!(
                        missing = ?resolution.missing,
                        "Continuing without unresolved required capabilities"
                    );
                    self.audit.warn(
                        "required capabilities unresolved",
                        serde_json::json!({
                            "template_id": template_id,
                            "missing": resolution.missing,
                        }),
                    );
                }
            }
        }

        let eval = EvalContext {
            context: &initial_context,
            available_capabilities: snapshot.available_capabilities(),
        };
        let graph = GraphBuilder::build(resolution.nodes, snapshot.dependencies(), &eval)?;

        let instance = WorkflowInstance::new(
            template_id,
            operation_id,
            graph,
            WorkflowContext::from_map(initial_context),
        );
        let workflow_id = instance.id.clone();

        // Persist before spawning so status queries see the instance
        self.store.save(instance.to_snapshot()?).await?;
        self.audit.info(
            "workflow started",
            serde_json::json!({
                "workflow_id": workflow_id.0,
                "template_id": template_id,
                "operation_id": operation_id,
            }),
        );

        self.spawn(instance, &template);
        Ok(workflow_id)
    }

    fn spawn(&self, mut instance: WorkflowInstance, template: &WorkflowTemplate) {
        let workflow_id = instance.id.clone();
        let control = Arc::new(WorkflowControl::new());
        let scheduler = PhaseScheduler::new(
            self.handlers.clone(),
            self.store.clone(),
            self.audit.clone(),
            template.retry.clone(),
            template.fallback_behavior,
        );

        let task_control = control.clone();
        let task_id = workflow_id.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = scheduler.run(&mut instance, &task_control).await {
                error!(workflow_id = %task_id, error = %e, "Scheduler run errored");
            }
        });

        if let Ok(mut running) = self.running.lock() {
            running.insert(workflow_id, RunningWorkflow { control, handle });
        }
    }

    /// Request a pause. Honored at the next phase boundary.
    pub fn pause(&self, workflow_id: &WorkflowId) -> Result<()> {
        let running = self
            .running
            .lock()
            .map_err(|e| TalonError::Config(e.to_string()))?;
        let entry = running
            .get(workflow_id)
            .ok_or_else(|| TalonError::WorkflowNotFound(workflow_id.to_string()))?;
        entry.control.request_pause();
        info!(workflow_id = %workflow_id, "Pause requested");
        Ok(())
    }

    /// Resume a paused or failed workflow from its last checkpoint.
    pub async fn resume(&self, workflow_id: &WorkflowId) -> Result<()> {
        {
            let mut running = self
                .running
                .lock()
                .map_err(|e| TalonError::Config(e.to_string()))?;
            if let Some(entry) = running.get(workflow_id) {
                if !entry.handle.is_finished() {
                    return Err(TalonError::Config(format!(
                        "Workflow '{}' is still running",
                        workflow_id
                    )));
                }
                running.remove(workflow_id);
            }
        }

        let snapshot = self
            .store
            .load(workflow_id.clone())
            .await?
            .ok_or_else(|| TalonError::WorkflowNotFound(workflow_id.to_string()))?;

        let mut instance = WorkflowInstance::from_snapshot(&snapshot)?;
        if !matches!(
            instance.status,
            WorkflowStatus::Paused | WorkflowStatus::Failed
        ) {
            return Err(TalonError::Config(format!(
                "Workflow '{}' is {} and cannot be resumed",
                workflow_id, instance.status
            )));
        }

        let template = self.template(&instance.template_id)?;
        instance.prepare_resume();
        self.audit.info(
            "workflow resumed",
            serde_json::json!({
                "workflow_id": workflow_id.0,
                "phase": instance.current_phase,
            }),
        );

        self.spawn(instance, &template);
        Ok(())
    }

    /// Cancel a workflow. A live run is cancelled at the next phase
    /// boundary; a checkpointed non-terminal run is marked cancelled
    /// directly.
    pub async fn cancel(&self, workflow_id: &WorkflowId) -> Result<()> {
        let live = self
            .running
            .lock()
            .ok()
            .and_then(|running| running.get(workflow_id).map(|e| e.control.clone()));

        if let Some(control) = live {
            control.cancel();
            info!(workflow_id = %workflow_id, "Cancellation requested");
            return Ok(());
        }

        let snapshot = self
            .store
            .load(workflow_id.clone())
            .await?
            .ok_or_else(|| TalonError::WorkflowNotFound(workflow_id.to_string()))?;
        let mut instance = WorkflowInstance::from_snapshot(&snapshot)?;
        if instance.status.is_terminal() {
            return Ok(());
        }
        instance.status = WorkflowStatus::Cancelled;
        self.store.save(instance.to_snapshot()?).await?;
        self.audit.info(
            "workflow cancelled",
            serde_json::json!({"workflow_id": workflow_id.0}),
        );
        Ok(())
    }

    /// Current status, read from the persisted checkpoint.
    pub async fn get_status(&self, workflow_id: &WorkflowId) -> Result<WorkflowProgress> {
        let snapshot = self
            .store
            .load(workflow_id.clone())
            .await?
            .ok_or_else(|| TalonError::WorkflowNotFound(workflow_id.to_string()))?;
        let instance = WorkflowInstance::from_snapshot(&snapshot)?;
        Ok(WorkflowProgress {
            status: instance.status,
            progress: instance.progress(),
            current_phase: instance.current_phase,
            context: instance.context.effective(),
            error_message: instance.error_message,
        })
    }

    /// Wait for a workflow's scheduler task to settle (tests and
    /// shutdown paths).
    pub async fn join(&self, workflow_id: &WorkflowId) -> Result<()> {
        let handle = {
            let mut running = self
                .running
                .lock()
                .map_err(|e| TalonError::Config(e.to_string()))?;
            running.remove(workflow_id).map(|entry| entry.handle)
        };
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| TalonError::Config(format!("Scheduler task panicked: {}", e)))?;
        }
        Ok(())
    }
}
