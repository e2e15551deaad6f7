use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, warn};

use talon_core::audit::AuditLog;
use talon_core::error::Result;
use talon_core::traits::CompletionClient;
use talon_core::types::{ChatMessage, CompletionOptions, ModuleSpec};

use crate::classify::{extract_json, DiscoveryAnalysis};
use crate::search::tokenize;

/// A candidate selected for branching, with the rationale recorded on
/// the spawned child node.
#[derive(Debug, Clone)]
pub struct RankedModule {
    pub module: ModuleSpec,
    pub score: f64,
    pub reasoning: String,
}

/// Selects up to `max` modules from a candidate pool by relevance to a
/// discovery.
pub trait ModuleRanker: Send + Sync + 'static {
    fn rank(
        &self,
        analysis: DiscoveryAnalysis,
        candidates: Vec<ModuleSpec>,
        max: usize,
    ) -> BoxFuture<'_, Result<Vec<RankedModule>>>;
}

/// Fixed boosts for module paths known to be high-yield against the
/// services the signature table can identify.
const PATH_WEIGHTS: &[(&str, f64)] = &[
    ("ms17_010", 3.0),
    ("eternalblue", 3.0),
    ("is_known_pipename", 2.5),
    ("usermap_script", 2.5),
    ("shellshock", 2.0),
    ("struts2", 1.5),
    ("tomcat_mgr", 1.5),
    ("vsftpd_234_backdoor", 2.0),
];

/// Deterministic keyword scorer: token overlap between the discovery
/// and each candidate path, plus the fixed rank-table boosts.
#[derive(Debug, Clone, Default)]
pub struct KeywordModuleRanker;

impl KeywordModuleRanker {
    pub fn score(analysis: &DiscoveryAnalysis, module: &ModuleSpec) -> (f64, Vec<String>) {
        let mut wanted: Vec<String> = Vec::new();
        for text in analysis
            .discovered_info
            .iter()
            .chain(analysis.search_queries.iter())
        {
            for token in tokenize(text) {
                if !wanted.contains(&token) {
                    wanted.push(token);
                }
            }
        }

        let path = module.path.to_lowercase();
        let mut matched = Vec::new();
        let mut score = 0.0;
        for token in &wanted {
            if path.contains(token.as_str()) {
                score += 1.0;
                matched.push(token.clone());
            }
        }
        for (fragment, weight) in PATH_WEIGHTS {
            if path.contains(fragment) {
                score += weight;
            }
        }
        (score, matched)
    }

    pub fn rank_deterministic(
        analysis: &DiscoveryAnalysis,
        candidates: &[ModuleSpec],
        max: usize,
    ) -> Vec<RankedModule> {
        let mut ranked: Vec<RankedModule> = candidates
            .iter()
            .filter_map(|module| {
                let (score, matched) = Self::score(analysis, module);
                (score > 0.0).then(|| RankedModule {
                    module: module.clone(),
                    score,
                    reasoning: format!(
                        "keyword score {:.1}, matched: {}",
                        score,
                        if matched.is_empty() {
                            "rank table".to_string()
                        } else {
                            matched.join(", ")
                        }
                    ),
                })
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.module.path.cmp(&b.module.path))
        });
        ranked.truncate(max);
        ranked
    }
}

impl ModuleRanker for KeywordModuleRanker {
    fn rank(
        &self,
        analysis: DiscoveryAnalysis,
        candidates: Vec<ModuleSpec>,
        max: usize,
    ) -> BoxFuture<'_, Result<Vec<RankedModule>>> {
        Box::pin(async move { Ok(Self::rank_deterministic(&analysis, &candidates, max)) })
    }
}

#[derive(Deserialize)]
struct RankVerdict {
    selections: Vec<RankSelection>,
}

#[derive(Deserialize)]
struct RankSelection {
    index: usize,
    #[serde(default)]
    reasoning: String,
}

/// AI-assisted relevance ranking with the keyword scorer as fallback.
pub struct LlmModuleRanker {
    client: Arc<dyn CompletionClient>,
    options: CompletionOptions,
    audit: Option<AuditLog>,
}

impl LlmModuleRanker {
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
        analysis: &DiscoveryAnalysis,
        candidates: &[ModuleSpec],
        max: usize,
    ) -> Result<Vec<RankedModule>> {
        let listing = candidates
            .iter()
            .enumerate()
            .map(|(i, m)| format!("{}. {} {}", i, m.module_type, m.path))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            r#"A reconnaissance step discovered:
{}

Candidate exploit modules:
{}

Select the at most {} most promising candidates. Respond with ONLY valid JSON:
{{ "selections": [ {{ "index": 0, "reasoning": "why" }} ] }}"#,
            analysis.discovered_info.join("\n"),
            listing,
            max,
        );

        let completion = self
            .client
            .complete(self.options.clone(), vec![ChatMessage::user(prompt)])
            .await?;
        let json = extract_json(&completion.content)
            .ok_or_else(|| talon_core::TalonError::Provider("no JSON in completion".into()))?;
        let verdict: RankVerdict = serde_json::from_str(json)
            .map_err(|e| talon_core::TalonError::Provider(format!("rank parse: {}", e)))?;

        let mut seen = std::collections::HashSet::new();
        let mut ranked = Vec::new();
        for selection in verdict.selections {
            if ranked.len() >= max {
                break;
            }
            if selection.index >= candidates.len() || !seen.insert(selection.index) {
                continue;
            }
            ranked.push(RankedModule {
                module: candidates[selection.index].clone(),
                score: (max - ranked.len()) as f64,
                reasoning: if selection.reasoning.is_empty() {
                    "selected by model".to_string()
                } else {
                    selection.reasoning
                },
            });
        }
        Ok(ranked)
    }
}

impl ModuleRanker for LlmModuleRanker {
    fn rank(
        &self,
        analysis: DiscoveryAnalysis,
        candidates: Vec<ModuleSpec>,
        max: usize,
    ) -> BoxFuture<'_, Result<Vec<RankedModule>>> {
        Box::pin(async move {
            match self.ask(&analysis, &candidates, max).await {
                Ok(ranked) if !ranked.is_empty() => {
                    debug!(selected = ranked.len(), "AI module ranking");
                    if let Some(audit) = &self.audit {
                        audit.info(
                            "provider call succeeded",
                            serde_json::json!({"call": "module_ranking", "selected": ranked.len()}),
                        );
                    }
                    Ok(ranked)
                }
                Ok(_) => Ok(KeywordModuleRanker::rank_deterministic(
                    &analysis, &candidates, max,
                )),
                Err(e) => {
                    warn!(error = %e, "AI module ranking failed, using keyword fallback");
                    if let Some(audit) = &self.audit {
                        audit.warn(
                            "provider fallback used",
                            serde_json::json!({"call": "module_ranking", "error": e.to_string()}),
                        );
                    }
                    Ok(KeywordModuleRanker::rank_deterministic(
                        &analysis, &candidates, max,
                    ))
                }
            }
        })
    }
}
