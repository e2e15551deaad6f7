use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::warn;

use talon_core::audit::AuditLog;
use talon_core::error::Result;
use talon_core::traits::CompletionClient;
use talon_core::types::{ChatMessage, CompletionOptions, ExecutionOutcome, ModuleSpec, ModuleType};

use crate::classify::{extract_json, truncate_output};

/// A follow-up post-exploitation module with the rationale recorded on
/// the spawned child node.
#[derive(Debug, Clone)]
pub struct PlannedModule {
    pub module: ModuleSpec,
    pub reasoning: String,
}

/// Derives follow-up post-exploitation modules after a successful
/// exploit.
pub trait PostExploitPlanner: Send + Sync + 'static {
    fn plan(
        &self,
        module: ModuleSpec,
        outcome: ExecutionOutcome,
        max: usize,
    ) -> BoxFuture<'_, Result<Vec<PlannedModule>>>;
}

/// The fixed sweep used when no AI plan is available: enumerate the
/// environment, look for privilege escalation paths, dump credentials.
const DEFAULT_POST_MODULES: &[&str] = &[
    "multi/recon/local_exploit_suggester",
    "multi/gather/env",
    "windows/gather/hashdump",
    "linux/gather/hashdump",
];

/// Deterministic planner returning the fixed default set.
#[derive(Debug, Clone, Default)]
pub struct DefaultPostExploitPlanner;

impl DefaultPostExploitPlanner {
    pub fn default_set(max: usize) -> Vec<PlannedModule> {
        DEFAULT_POST_MODULES
            .iter()
            .take(max)
            .map(|path| PlannedModule {
                module: ModuleSpec::new(ModuleType::Post, *path),
                reasoning: "default post-exploitation sweep".to_string(),
            })
            .collect()
    }
}

impl PostExploitPlanner for DefaultPostExploitPlanner {
    fn plan(
        &self,
        _module: ModuleSpec,
        _outcome: ExecutionOutcome,
        max: usize,
    ) -> BoxFuture<'_, Result<Vec<PlannedModule>>> {
        Box::pin(async move { Ok(Self::default_set(max)) })
    }
}

#[derive(Deserialize)]
struct PlanVerdict {
    modules: Vec<PlanEntry>,
}

#[derive(Deserialize)]
struct PlanEntry {
    path: String,
    #[serde(default)]
    reasoning: String,
}

/// AI-derived post-exploitation plan with the fixed default set as
/// fallback.
pub struct LlmPostExploitPlanner {
    client: Arc<dyn CompletionClient>,
    options: CompletionOptions,
    audit: Option<AuditLog>,
}

impl LlmPostExploitPlanner {
    pub fn new(client: Arc<dyn CompletionClient>, options: CompletionOptions) -> Self {
        Self {
            client,
            options,
            audit: None,
        }
    }

    pub fn from_options(options: CompletionOptions) -> Self {
        let client: Arc<dyn CompletionClient> =
            Arc::from(talon_llm::create_client(&options.provider));
        Self::new(client, options)
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    async fn ask(
        &self,
        module: &ModuleSpec,
        outcome: &ExecutionOutcome,
        max: usize,
    ) -> Result<Vec<PlannedModule>> {
        let prompt = format!(
            r#"The exploit below opened a session on the target. Propose up to {} post
modules (paths without the "post/" prefix) to run next.

Exploit: {}
Output:
{}

Respond with ONLY valid JSON:
{{ "modules": [ {{ "path": "multi/gather/env", "reasoning": "why" }} ] }}"#,
            max,
            module.path,
            truncate_output(&outcome.output, 2000),
        );

        let completion = self
            .client
            .complete(self.options.clone(), vec![ChatMessage::user(prompt)])
            .await?;
        let json = extract_json(&completion.content)
            .ok_or_else(|| talon_core::TalonError::Provider("no JSON in completion".into()))?;
        let verdict: PlanVerdict = serde_json::from_str(json)
            .map_err(|e| talon_core::TalonError::Provider(format!("plan parse: {}", e)))?;

        let planned: Vec<PlannedModule> = verdict
            .modules
            .into_iter()
            .take(max)
            .map(|entry| {
                let path = entry
                    .path
                    .strip_prefix("post/")
                    .unwrap_or(&entry.path)
                    .to_string();
                PlannedModule {
                    module: ModuleSpec::new(ModuleType::Post, path),
                    reasoning: if entry.reasoning.is_empty() {
                        "proposed by model".to_string()
                    } else {
                        entry.reasoning
                    },
                }
            })
            .collect();
        Ok(planned)
    }
}

impl PostExploitPlanner for LlmPostExploitPlanner {
    fn plan(
        &self,
        module: ModuleSpec,
        outcome: ExecutionOutcome,
        max: usize,
    ) -> BoxFuture<'_, Result<Vec<PlannedModule>>> {
        Box::pin(async move {
            match self.ask(&module, &outcome, max).await {
                Ok(planned) if !planned.is_empty() => {
                    if let Some(audit) = &self.audit {
                        audit.info(
                            "provider call succeeded",
                            serde_json::json!({"call": "post_exploit_plan", "module": module.path}),
                        );
                    }
                    Ok(planned)
                }
                Ok(_) => Ok(DefaultPostExploitPlanner::default_set(max)),
                Err(e) => {
                    warn!(module = %module.path, error = %e, "AI post-exploit planning failed, using default set");
                    if let Some(audit) = &self.audit {
                        audit.warn(
                            "provider fallback used",
                            serde_json::json!({
                                "call": "post_exploit_plan",
                                "module": module.path,
                                "error": e.to_string(),
                            }),
                        );
                    }
                    Ok(DefaultPostExploitPlanner::default_set(max))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talon_core::types::Completion;

    #[test]
    fn test_default_set_respects_max() {
        let planned = DefaultPostExploitPlanner::default_set(2);
        assert_eq!(planned.len(), 2);
        assert!(planned
            .iter()
            .all(|p| p.module.module_type == ModuleType::Post));
    }

    struct CannedClient {
        response: std::result::Result<String, String>,
    }

    impl CompletionClient for CannedClient {
        fn complete(
            &self,
            _options: CompletionOptions,
            _messages: Vec<ChatMessage>,
        ) -> BoxFuture<'_, Result<Completion>> {
            Box::pin(async move {
                match &self.response {
                    Ok(content) => Ok(Completion {
                        content: content.clone(),
                    }),
                    Err(e) => Err(talon_core::TalonError::Provider(e.clone())),
                }
            })
        }
    }

    fn exploit() -> (ModuleSpec, ExecutionOutcome) {
        (
            ModuleSpec::new(ModuleType::Exploit, "linux/samba/is_known_pipename"),
            ExecutionOutcome::success("Command shell session 1 opened"),
        )
    }

    #[tokio::test]
    async fn test_llm_plan_strips_post_prefix() {
        let client = Arc::new(CannedClient {
            response: Ok(r#"{"modules": [
                {"path": "post/linux/gather/hashdump", "reasoning": "credentials"},
                {"path": "multi/gather/env"}
            ]}"#
            .to_string()),
        });
        let planner = LlmPostExploitPlanner::new(client, CompletionOptions::default());
        let (module, outcome) = exploit();
        let planned = planner.plan(module, outcome, 3).await.unwrap();
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].module.path, "linux/gather/hashdump");
        assert_eq!(planned[1].reasoning, "proposed by model");
    }

    #[tokio::test]
    async fn test_llm_plan_falls_back() {
        let client = Arc::new(CannedClient {
            response: Err("status 500".to_string()),
        });
        let planner = LlmPostExploitPlanner::new(client, CompletionOptions::default());
        let (module, outcome) = exploit();
        let planned = planner.plan(module, outcome, 2).await.unwrap();
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].module.path, "multi/recon/local_exploit_suggester");
    }
}
