use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Dependency inclusion condition.
///
/// A small closed set of variants evaluated recursively; there is no
/// runtime parsing of expression strings. An absent condition
/// (`Option::None` on the dependency row) evaluates to true, so schema
/// drift does not silently block a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// True when the context field exists (dotted paths traverse nested
    /// objects, e.g. `scan.open_ports`).
    Exists { field: String },
    /// True when the context field equals `value`. `negate` inverts.
    Equals {
        field: String,
        value: serde_json::Value,
        #[serde(default)]
        negate: bool,
    },
    /// True when the named capability resolved to an available agent.
    CapabilityAvailable { capability: String },
    Not { inner: Box<Condition> },
    And { conditions: Vec<Condition> },
    Or { conditions: Vec<Condition> },
}

/// Everything a condition can be evaluated against: the workflow context
/// and the set of capabilities that resolved to an available agent.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub context: &'a HashMap<String, serde_json::Value>,
    pub available_capabilities: &'a HashSet<String>,
}

impl Condition {
    /// Evaluate this condition.
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> bool {
        match self {
            Self::Exists { field } => lookup_field(ctx.context, field).is_some(),
            Self::Equals {
                field,
                value,
                negate,
            } => {
                let matches = lookup_field(ctx.context, field).is_some_and(|v| v == value);
                matches != *negate
            }
            Self::CapabilityAvailable { capability } => {
                ctx.available_capabilities.contains(capability)
            }
            Self::Not { inner } => !inner.evaluate(ctx),
            Self::And { conditions } => conditions.iter().all(|c| c.evaluate(ctx)),
            Self::Or { conditions } => conditions.iter().any(|c| c.evaluate(ctx)),
        }
    }
}

/// Evaluate an optional condition: absent conditions are fail-open.
pub fn evaluate_opt(condition: Option<&Condition>, ctx: &EvalContext<'_>) -> bool {
    match condition {
        Some(c) => c.evaluate(ctx),
        None => true,
    }
}

/// Look up a dotted field path in the context map.
///
/// A leading `context.` prefix is tolerated for compatibility with stored
/// dependency rows that spell the path fully qualified.
fn lookup_field<'a>(
    context: &'a HashMap<String, serde_json::Value>,
    field: &str,
) -> Option<&'a serde_json::Value> {
    let path = field.strip_prefix("context.").unwrap_or(field);
    let mut segments = path.split('.');

    let mut current = context.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}
