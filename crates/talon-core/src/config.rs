use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TalonError};
use crate::types::{CompletionOptions, FallbackBehavior};

/// Bounded retry policy for node execution.
///
/// A node gets `max_retries + 1` attempts; the delay before attempt `n`
/// (1-based, so the first retry is attempt 2) is
/// `min(max_delay, base_delay * backoff_multiplier^(n-2))`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    500
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_delay() -> u64 {
    30_000
}

impl RetryPolicy {
    /// Delay to sleep before re-running a node that has already made
    /// `attempt` attempts (so `attempt >= 1`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let ms = (self.base_delay_ms as f64) * self.backoff_multiplier.powi(exp as i32);
        Duration::from_millis((ms as u64).min(self.max_delay_ms))
    }

    /// A policy that never retries (single attempt).
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Structural bounds for one attack-tree run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackTreeConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_max_total_executions")]
    pub max_total_executions: u32,
    #[serde(default = "default_max_children")]
    pub max_children_per_node: usize,
    #[serde(default = "default_max_post_exploit")]
    pub max_post_exploit_scans: usize,
}

impl Default for AttackTreeConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_total_executions: default_max_total_executions(),
            max_children_per_node: default_max_children(),
            max_post_exploit_scans: default_max_post_exploit(),
        }
    }
}

fn default_max_depth() -> u32 {
    4
}
fn default_max_total_executions() -> u32 {
    25
}
fn default_max_children() -> usize {
    3
}
fn default_max_post_exploit() -> usize {
    3
}

/// Top-level engine configuration, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub completion: CompletionOptions,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub fallback_behavior: FallbackBehavior,
    #[serde(default)]
    pub attack_tree: AttackTreeConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TalonError::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&raw).map_err(|e| TalonError::Config(format!("{}: {}", path.display(), e)))
    }
}
