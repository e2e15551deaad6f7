use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::Condition;

/// Unique workflow instance identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named function an agent can perform (e.g., "vulnerability_scan").
///
/// Multiple agents may offer the same capability; resolution picks the
/// highest-priority available offer, ties broken by registration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// Agent offering this capability.
    pub agent_id: String,
    /// Capability name.
    pub name: String,
    /// Context keys this capability consumes.
    #[serde(default)]
    pub input_types: Vec<String>,
    /// Context keys this capability produces.
    #[serde(default)]
    pub output_types: Vec<String>,
    /// Resolution priority (higher wins).
    #[serde(default)]
    pub priority: i32,
    /// Whether the offering agent is currently available.
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

impl Capability {
    /// Create a capability offer with default priority and availability.
    pub fn new(agent_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            input_types: vec![],
            output_types: vec![],
            priority: 0,
            available: true,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_inputs(mut self, types: Vec<String>) -> Self {
        self.input_types = types;
        self
    }

    pub fn with_outputs(mut self, types: Vec<String>) -> Self {
        self.output_types = types;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

/// How a dependency row participates in graph construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Always contributes an edge.
    Required,
    /// Contributes an edge only if its condition evaluates true.
    Optional,
    /// Same inclusion rule as Optional; declared intent differs.
    Conditional,
}

/// A declared dependency: `agent_id` needs the output of `depends_on`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    /// The dependent agent.
    pub agent_id: String,
    /// Capability name the agent depends on.
    pub depends_on: String,
    pub kind: DependencyKind,
    /// Inclusion condition for Optional/Conditional rows.
    /// Absent means the row is always included (fail-open).
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl Dependency {
    pub fn required(agent_id: impl Into<String>, depends_on: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            depends_on: depends_on.into(),
            kind: DependencyKind::Required,
            condition: None,
        }
    }

    pub fn optional(
        agent_id: impl Into<String>,
        depends_on: impl Into<String>,
        condition: Option<Condition>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            depends_on: depends_on.into(),
            kind: DependencyKind::Optional,
            condition,
        }
    }

    pub fn conditional(
        agent_id: impl Into<String>,
        depends_on: impl Into<String>,
        condition: Condition,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            depends_on: depends_on.into(),
            kind: DependencyKind::Conditional,
            condition: Some(condition),
        }
    }
}

/// An agent as stored in the capability/dependency store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

/// Status of a resolved graph node. Transitions are monotonic in
/// declaration order; back-transitions are never applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    /// Position in the monotonic transition order.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed => 2,
            Self::Failed => 3,
            Self::Skipped => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Statuses no further progress is possible from. `Failed` is not
    /// terminal here: a node-level failure can be resumed manually.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// What a node failure does to the surrounding phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackBehavior {
    /// Abort the whole workflow immediately.
    Fail,
    /// Remaining nodes in the phase and subsequent phases proceed.
    #[default]
    Skip,
    /// Reserved for a fallback-agent strategy; currently behaves as Skip.
    Substitute,
}

/// Tool module category.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    Auxiliary,
    Exploit,
    Post,
}

impl ModuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auxiliary => "auxiliary",
            Self::Exploit => "exploit",
            Self::Post => "post",
        }
    }
}

impl std::fmt::Display for ModuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tool module invocation: category, filesystem-like path, parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub module_type: ModuleType,
    pub path: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl ModuleSpec {
    pub fn new(module_type: ModuleType, path: impl Into<String>) -> Self {
        Self {
            module_type,
            path: path.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Key used to enforce "a given (type, path) is executed at most once
    /// per tree run".
    pub fn visit_key(&self) -> String {
        format!("{}:{}", self.module_type, self.path)
    }
}

/// Raw result of one tool module execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl ExecutionOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            stderr: String::new(),
            exit_code: 0,
            duration_ms: 0,
        }
    }

    pub fn failure(stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            success: false,
            output: String::new(),
            stderr: stderr.into(),
            exit_code,
            duration_ms: 0,
        }
    }
}

/// Assessment target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
}

impl Target {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// A persisted workflow checkpoint: the serialized instance plus the
/// metadata needed to list and resume it without deserializing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub id: WorkflowId,
    pub status: WorkflowStatus,
    /// JSON-serialized workflow instance (graph, context, node states).
    pub instance_json: String,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSnapshot {
    pub fn new(id: WorkflowId, status: WorkflowStatus, instance_json: String) -> Self {
        Self {
            id,
            status,
            instance_json,
            updated_at: Utc::now(),
        }
    }
}

/// Severity of an audit log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// One record in the append-only audit stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    /// Structured context (workflow id, node, phase, module, ...).
    #[serde(default)]
    pub context: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>, context: serde_json::Value) -> Self {
        Self {
            level,
            message: message.into(),
            context,
            timestamp: Utc::now(),
        }
    }

    pub fn info(message: impl Into<String>, context: serde_json::Value) -> Self {
        Self::new(LogLevel::Info, message, context)
    }

    pub fn warn(message: impl Into<String>, context: serde_json::Value) -> Self {
        Self::new(LogLevel::Warn, message, context)
    }

    pub fn error(message: impl Into<String>, context: serde_json::Value) -> Self {
        Self::new(LogLevel::Error, message, context)
    }
}

/// Role in a completion conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message sent to the completion provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Options for a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionOptions {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_provider() -> String {
    "anthropic".to_string()
}
fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_temperature() -> f32 {
    0.0
}
fn default_max_tokens() -> u32 {
    4096
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// A completed (non-streaming) provider response.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_id_unique() {
        assert_ne!(WorkflowId::new().0, WorkflowId::new().0);
    }

    #[test]
    fn test_capability_builder() {
        let cap = Capability::new("scanner-1", "port_scan")
            .with_priority(5)
            .with_outputs(vec!["open_ports".into()]);
        assert_eq!(cap.agent_id, "scanner-1");
        assert_eq!(cap.priority, 5);
        assert!(cap.available);
        assert_eq!(cap.output_types, vec!["open_ports"]);
    }

    #[test]
    fn test_node_status_monotonic_rank() {
        assert!(NodeStatus::Pending.rank() < NodeStatus::Running.rank());
        assert!(NodeStatus::Running.rank() < NodeStatus::Completed.rank());
        assert!(!NodeStatus::Running.is_terminal());
        assert!(NodeStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_module_visit_key() {
        let module = ModuleSpec::new(ModuleType::Exploit, "windows/smb/ms17_010_eternalblue");
        assert_eq!(module.visit_key(), "exploit:windows/smb/ms17_010_eternalblue");
    }

    #[test]
    fn test_module_params_ordered() {
        let module = ModuleSpec::new(ModuleType::Auxiliary, "scanner/smb/smb_version")
            .with_param("RHOSTS", "10.0.0.5")
            .with_param("LPORT", "4444");
        // BTreeMap keeps parameters in key order for stable serialization
        let keys: Vec<&String> = module.parameters.keys().collect();
        assert_eq!(keys, vec!["LPORT", "RHOSTS"]);
    }

    #[test]
    fn test_log_record_serializes() {
        let rec = LogRecord::info("node completed", serde_json::json!({"node": "recon"}));
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"level\":\"info\""));
        assert!(json.contains("recon"));
    }

    #[test]
    fn test_dependency_constructors() {
        let dep = Dependency::required("b", "cap_a");
        assert_eq!(dep.kind, DependencyKind::Required);
        assert!(dep.condition.is_none());
    }
}
