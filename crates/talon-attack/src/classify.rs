use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use talon_core::audit::AuditLog;
use talon_core::error::Result;
use talon_core::traits::CompletionClient;
use talon_core::types::{ChatMessage, CompletionOptions, ExecutionOutcome, ModuleSpec};

/// A discovery yields at most this many derived search queries.
pub const MAX_SEARCH_QUERIES: usize = 3;

/// Result of classifying an auxiliary/post node for discovery.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryAnalysis {
    pub is_discovery: bool,
    pub discovered_info: Vec<String>,
    pub search_queries: Vec<String>,
    pub reasoning: String,
}

/// Result of classifying an exploit node for success.
#[derive(Debug, Clone, Default)]
pub struct ExploitAnalysis {
    pub is_success: bool,
    /// The output fragment that indicated success.
    pub evidence: Option<String>,
    pub reasoning: String,
}

/// Did a reconnaissance module reveal actionable facts?
pub trait DiscoveryClassifier: Send + Sync + 'static {
    fn classify(
        &self,
        module: ModuleSpec,
        outcome: ExecutionOutcome,
    ) -> BoxFuture<'_, Result<DiscoveryAnalysis>>;
}

/// Did an exploit module open a session or shell?
pub trait ExploitClassifier: Send + Sync + 'static {
    fn classify(
        &self,
        module: ModuleSpec,
        outcome: ExecutionOutcome,
    ) -> BoxFuture<'_, Result<ExploitAnalysis>>;
}

// ── Deterministic pattern tables ─────────────────────────────────────

/// Versioned service banners. Group 1 is the full version, group 2 the
/// major.minor pair used for the search query.
struct ServiceSignature {
    service: &'static str,
    pattern: &'static str,
}

const SERVICE_SIGNATURES: &[ServiceSignature] = &[
    ServiceSignature {
        service: "samba",
        pattern: r"(?i)samba\s+((\d+\.\d+)(?:\.\d+)*)",
    },
    ServiceSignature {
        service: "openssh",
        pattern: r"(?i)openssh[_\s-]((\d+\.\d+)(?:p\d+)?)",
    },
    ServiceSignature {
        service: "apache",
        pattern: r"(?i)apache(?:/|\s+httpd\s+|\s+)((\d+\.\d+)(?:\.\d+)*)",
    },
    ServiceSignature {
        service: "nginx",
        pattern: r"(?i)nginx/((\d+\.\d+)(?:\.\d+)*)",
    },
    ServiceSignature {
        service: "vsftpd",
        pattern: r"(?i)vsftpd\s+((\d+\.\d+)(?:\.\d+)*)",
    },
    ServiceSignature {
        service: "proftpd",
        pattern: r"(?i)proftpd\s+((\d+\.\d+)(?:\.\d+)*)",
    },
    ServiceSignature {
        service: "mysql",
        pattern: r"(?i)mysql\s+((\d+\.\d+)(?:\.\d+)*)",
    },
    ServiceSignature {
        service: "iis",
        pattern: r"(?i)(?:microsoft-)?iis/((\d+\.\d+))",
    },
    ServiceSignature {
        service: "tomcat",
        pattern: r"(?i)tomcat[/\s]((\d+\.\d+)(?:\.\d+)*)",
    },
];

/// Unversioned host/credential indicators with a fixed search query.
struct IndicatorSignature {
    info: &'static str,
    query: &'static str,
    pattern: &'static str,
}

const INDICATOR_SIGNATURES: &[IndicatorSignature] = &[
    IndicatorSignature {
        info: "Windows host identified",
        query: "windows smb",
        pattern: r"(?i)windows\s+(server\s+)?(2008|2012|2016|2019|2022|xp|vista|7|8\.1|8|10|11)",
    },
    IndicatorSignature {
        info: "Linux kernel identified",
        query: "linux kernel privilege escalation",
        pattern: r"(?i)linux\s+\d+\.\d+",
    },
    IndicatorSignature {
        info: "Valid credentials observed",
        query: "credential login",
        pattern: r"(?i)(login successful|authentication succeeded|valid credentials|password accepted)",
    },
    IndicatorSignature {
        info: "Anonymous access permitted",
        query: "anonymous access",
        pattern: r"(?i)anonymous (login|access) (allowed|permitted|successful)",
    },
];

/// Session/shell-open indicators for exploit success.
const SESSION_SIGNATURES: &[&str] = &[
    r"(?i)meterpreter session \d+ opened",
    r"(?i)command shell session \d+ opened",
    r"(?i)session \d+ (opened|created)",
    r"(?i)\bshell spawned\b",
    r"(?i)\broot shell\b",
];

fn service_regexes() -> &'static Vec<(&'static str, Regex)> {
    static REGEXES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        SERVICE_SIGNATURES
            .iter()
            .map(|sig| {
                (
                    sig.service,
                    Regex::new(sig.pattern).expect("valid service signature"),
                )
            })
            .collect()
    })
}

fn indicator_regexes() -> &'static Vec<(&'static IndicatorSignature, Regex)> {
    static REGEXES: OnceLock<Vec<(&'static IndicatorSignature, Regex)>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        INDICATOR_SIGNATURES
            .iter()
            .map(|sig| (sig, Regex::new(sig.pattern).expect("valid indicator signature")))
            .collect()
    })
}

fn session_regexes() -> &'static Vec<Regex> {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        SESSION_SIGNATURES
            .iter()
            .map(|p| Regex::new(p).expect("valid session signature"))
            .collect()
    })
}

// ── Deterministic classifiers ────────────────────────────────────────

/// Fixed-table discovery classifier. No external calls; this is the
/// floor the engine degrades to without AI access.
#[derive(Debug, Clone, Default)]
pub struct PatternDiscoveryClassifier;

impl PatternDiscoveryClassifier {
    pub fn analyze(output: &str) -> DiscoveryAnalysis {
        let mut discovered_info = Vec::new();
        let mut search_queries: Vec<String> = Vec::new();

        for (service, regex) in service_regexes() {
            if let Some(captures) = regex.captures(output) {
                let full = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
                let major_minor = captures.get(2).map(|m| m.as_str()).unwrap_or(full);
                discovered_info.push(format!("{} {}", service, full));
                let query = format!("{} {}", service, major_minor);
                if !search_queries.contains(&query) {
                    search_queries.push(query);
                }
            }
        }

        for (sig, regex) in indicator_regexes() {
            if regex.is_match(output) {
                discovered_info.push(sig.info.to_string());
                let query = sig.query.to_string();
                if !search_queries.contains(&query) {
                    search_queries.push(query);
                }
            }
        }

        search_queries.truncate(MAX_SEARCH_QUERIES);
        let is_discovery = !discovered_info.is_empty();
        let reasoning = if is_discovery {
            format!("matched signatures: {}", discovered_info.join("; "))
        } else {
            "no known service or host signature matched".to_string()
        };

        DiscoveryAnalysis {
            is_discovery,
            discovered_info,
            search_queries,
            reasoning,
        }
    }
}

impl DiscoveryClassifier for PatternDiscoveryClassifier {
    fn classify(
        &self,
        _module: ModuleSpec,
        outcome: ExecutionOutcome,
    ) -> BoxFuture<'_, Result<DiscoveryAnalysis>> {
        Box::pin(async move { Ok(Self::analyze(&outcome.output)) })
    }
}

/// Fixed-table exploit-success classifier.
#[derive(Debug, Clone, Default)]
pub struct PatternExploitClassifier;

impl PatternExploitClassifier {
    pub fn analyze(output: &str) -> ExploitAnalysis {
        for regex in session_regexes() {
            if let Some(found) = regex.find(output) {
                return ExploitAnalysis {
                    is_success: true,
                    evidence: Some(found.as_str().to_string()),
                    reasoning: format!("session indicator: {}", found.as_str()),
                };
            }
        }
        ExploitAnalysis {
            is_success: false,
            evidence: None,
            reasoning: "no session or shell indicator in output".to_string(),
        }
    }
}

impl ExploitClassifier for PatternExploitClassifier {
    fn classify(
        &self,
        _module: ModuleSpec,
        outcome: ExecutionOutcome,
    ) -> BoxFuture<'_, Result<ExploitAnalysis>> {
        Box::pin(async move { Ok(Self::analyze(&outcome.output)) })
    }
}

// ── AI-assisted classifiers ──────────────────────────────────────────

/// Pull the JSON object out of a completion that may wrap it in prose
/// or code fences.
pub(crate) fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

pub(crate) fn truncate_output(output: &str, max_chars: usize) -> &str {
    match output.char_indices().nth(max_chars) {
        Some((idx, _)) => &output[..idx],
        None => output,
    }
}

#[derive(Deserialize)]
struct DiscoveryVerdict {
    is_discovery: bool,
    #[serde(default)]
    discovered_info: Vec<String>,
    #[serde(default)]
    search_queries: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

/// AI-assisted discovery classification with the pattern table as its
/// documented deterministic fallback. Provider failures never escape:
/// they downgrade to the fallback with a warning.
pub struct LlmDiscoveryClassifier {
    client: Arc<dyn CompletionClient>,
    options: CompletionOptions,
    audit: Option<AuditLog>,
}

impl LlmDiscoveryClassifier {
    pub fn new(client: Arc<dyn CompletionClient>, options: CompletionOptions) -> Self {
        Self {
            client,
            options,
            audit: None,
        }
    }

    /// Build a classifier over the configured provider.
    pub fn from_options(options: CompletionOptions) -> Self {
        let client: Arc<dyn CompletionClient> = Arc::from(talon_llm::create_client(&options.provider));
        Self::new(client, options)
    }

    /// Record provider calls and fallbacks on the audit stream.
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    async fn ask(&self, module: &ModuleSpec, outcome: &ExecutionOutcome) -> Result<DiscoveryAnalysis> {
        let prompt = format!(
            r#"You are analyzing security assessment tool output for actionable discoveries
(service versions, OS identification, credentials, protocol details).

Module: {} {}
Exit code: {}
Output:
{}

Respond with ONLY valid JSON:
{{
  "is_discovery": true | false,
  "discovered_info": ["fact", ...],
  "search_queries": ["up to {} short exploit search queries"],
  "reasoning": "brief explanation"
}}"#,
            module.module_type,
            module.path,
            outcome.exit_code,
            truncate_output(&outcome.output, 4000),
            MAX_SEARCH_QUERIES,
        );

        let completion = self
            .client
            .complete(self.options.clone(), vec![ChatMessage::user(prompt)])
            .await?;

        let json = extract_json(&completion.content)
            .ok_or_else(|| talon_core::TalonError::Provider("no JSON in completion".into()))?;
        let verdict: DiscoveryVerdict = serde_json::from_str(json)
            .map_err(|e| talon_core::TalonError::Provider(format!("verdict parse: {}", e)))?;

        let mut queries = verdict.search_queries;
        queries.truncate(MAX_SEARCH_QUERIES);
        Ok(DiscoveryAnalysis {
            is_discovery: verdict.is_discovery,
            discovered_info: verdict.discovered_info,
            search_queries: queries,
            reasoning: verdict.reasoning,
        })
    }
}

impl DiscoveryClassifier for LlmDiscoveryClassifier {
    fn classify(
        &self,
        module: ModuleSpec,
        outcome: ExecutionOutcome,
    ) -> BoxFuture<'_, Result<DiscoveryAnalysis>> {
        Box::pin(async move {
            match self.ask(&module, &outcome).await {
                Ok(analysis) => {
                    debug!(module = %module.path, is_discovery = analysis.is_discovery, "AI discovery verdict");
                    if let Some(audit) = &self.audit {
                        audit.info(
                            "provider call succeeded",
                            serde_json::json!({"call": "discovery_classification", "module": module.path}),
                        );
                    }
                    Ok(analysis)
                }
                Err(e) => {
                    warn!(module = %module.path, error = %e, "AI discovery classification failed, using pattern fallback");
                    if let Some(audit) = &self.audit {
                        audit.warn(
                            "provider fallback used",
                            serde_json::json!({
                                "call": "discovery_classification",
                                "module": module.path,
                                "error": e.to_string(),
                            }),
                        );
                    }
                    Ok(PatternDiscoveryClassifier::analyze(&outcome.output))
                }
            }
        })
    }
}

#[derive(Deserialize)]
struct ExploitVerdict {
    is_success: bool,
    #[serde(default)]
    evidence: Option<String>,
    #[serde(default)]
    reasoning: String,
}

/// AI-assisted exploit-success classification with the session-pattern
/// table as fallback.
pub struct LlmExploitClassifier {
    client: Arc<dyn CompletionClient>,
    options: CompletionOptions,
    audit: Option<AuditLog>,
}

impl LlmExploitClassifier {
    pub fn new(client: Arc<dyn CompletionClient>, options: CompletionOptions) -> Self {
        Self {
            client,
            options,
            audit: None,
        }
    }

    pub fn from_options(options: CompletionOptions) -> Self {
        let client: Arc<dyn CompletionClient> = Arc::from(talon_llm::create_client(&options.provider));
        Self::new(client, options)
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    async fn ask(&self, module: &ModuleSpec, outcome: &ExecutionOutcome) -> Result<ExploitAnalysis> {
        let prompt = format!(
            r#"Did this exploit module open a session or shell on the target?

Module: {} {}
Exit code: {}
Output:
{}

Respond with ONLY valid JSON:
{{ "is_success": true | false, "evidence": "output fragment or null", "reasoning": "brief" }}"#,
            module.module_type,
            module.path,
            outcome.exit_code,
            truncate_output(&outcome.output, 4000),
        );

        let completion = self
            .client
            .complete(self.options.clone(), vec![ChatMessage::user(prompt)])
            .await?;

        let json = extract_json(&completion.content)
            .ok_or_else(|| talon_core::TalonError::Provider("no JSON in completion".into()))?;
        let verdict: ExploitVerdict = serde_json::from_str(json)
            .map_err(|e| talon_core::TalonError::Provider(format!("verdict parse: {}", e)))?;

        Ok(ExploitAnalysis {
            is_success: verdict.is_success,
            evidence: verdict.evidence,
            reasoning: verdict.reasoning,
        })
    }
}

impl ExploitClassifier for LlmExploitClassifier {
    fn classify(
        &self,
        module: ModuleSpec,
        outcome: ExecutionOutcome,
    ) -> BoxFuture<'_, Result<ExploitAnalysis>> {
        Box::pin(async move {
            match self.ask(&module, &outcome).await {
                Ok(analysis) => {
                    if let Some(audit) = &self.audit {
                        audit.info(
                            "provider call succeeded",
                            serde_json::json!({"call": "exploit_classification", "module": module.path}),
                        );
                    }
                    Ok(analysis)
                }
                Err(e) => {
                    warn!(module = %module.path, error = %e, "AI exploit classification failed, using pattern fallback");
                    if let Some(audit) = &self.audit {
                        audit.warn(
                            "provider fallback used",
                            serde_json::json!({
                                "call": "exploit_classification",
                                "module": module.path,
                                "error": e.to_string(),
                            }),
                        );
                    }
                    Ok(PatternExploitClassifier::analyze(&outcome.output))
                }
            }
        })
    }
}
