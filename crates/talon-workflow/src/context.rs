use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Workflow context: the sole data channel between phases.
///
/// Modeled as an append-only stack of per-phase overlays over a base map.
/// Each completed node's output is staged for its phase and merged at the
/// phase barrier in capability-name order, so the merged view is
/// deterministic and any phase's input view can be reproduced exactly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowContext {
    base: HashMap<String, serde_json::Value>,
    overlays: Vec<PhaseOverlay>,
}

/// Outputs merged at the end of one phase, in merge order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseOverlay {
    pub phase: u32,
    entries: Vec<(String, serde_json::Value)>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context from initial data (the caller-supplied operation
    /// context).
    pub fn from_map(base: HashMap<String, serde_json::Value>) -> Self {
        Self {
            base,
            overlays: Vec::new(),
        }
    }

    /// Merge a phase's node outputs as a new overlay.
    ///
    /// Entries are sorted by key before being appended, which makes the
    /// winner of a same-phase key collision deterministic (last key in
    /// sort order wins).
    pub fn apply_phase(&mut self, phase: u32, mut outputs: Vec<(String, serde_json::Value)>) {
        if outputs.is_empty() {
            return;
        }
        outputs.sort_by(|(a, _), (b, _)| a.cmp(b));
        self.overlays.push(PhaseOverlay {
            phase,
            entries: outputs,
        });
    }

    /// The fully merged view: base, then overlays in phase order,
    /// last-writer-wins per key.
    pub fn effective(&self) -> HashMap<String, serde_json::Value> {
        self.view_before_phase(u32::MAX)
    }

    /// The merged view a node in `phase` observes: base plus every
    /// overlay from earlier phases.
    pub fn view_before_phase(&self, phase: u32) -> HashMap<String, serde_json::Value> {
        let mut view = self.base.clone();
        for overlay in self.overlays.iter().filter(|o| o.phase < phase) {
            for (key, value) in &overlay.entries {
                view.insert(key.clone(), value.clone());
            }
        }
        view
    }

    /// Get a value from the merged view (newest overlay first).
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        for overlay in self.overlays.iter().rev() {
            if let Some((_, value)) = overlay.entries.iter().rev().find(|(k, _)| k == key) {
                return Some(value);
            }
        }
        self.base.get(key)
    }

    /// Capability names that have produced output so far.
    pub fn produced_keys(&self) -> Vec<&str> {
        self.overlays
            .iter()
            .flat_map(|o| o.entries.iter().map(|(k, _)| k.as_str()))
            .collect()
    }
}
