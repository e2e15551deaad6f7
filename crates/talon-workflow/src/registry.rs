use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use talon_core::error::Result;
use talon_core::traits::AgentStore;
use talon_core::types::{AgentRecord, Capability, Dependency};

/// A consistent point-in-time view of the capability/dependency store.
///
/// Snapshots are immutable once built; concurrent resolutions each hold an
/// `Arc` to whichever snapshot was current when they started, so a refresh
/// never blocks readers and readers never observe a half-built index.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    /// Offers grouped by capability name, in registration order.
    capabilities: HashMap<String, Vec<Capability>>,
    dependencies: Vec<Dependency>,
    /// Capability names with at least one available offer.
    available: HashSet<String>,
}

impl RegistrySnapshot {
    /// Build a snapshot from agent records (in registration order).
    pub fn from_agents(agents: &[AgentRecord]) -> Self {
        let mut capabilities: HashMap<String, Vec<Capability>> = HashMap::new();
        let mut dependencies = Vec::new();
        let mut available = HashSet::new();

        for agent in agents {
            for capability in &agent.capabilities {
                if capability.available {
                    available.insert(capability.name.clone());
                }
                capabilities
                    .entry(capability.name.clone())
                    .or_default()
                    .push(capability.clone());
            }
            dependencies.extend(agent.dependencies.iter().cloned());
        }

        Self {
            capabilities,
            dependencies,
            available,
        }
    }

    /// The best available offer for a capability: highest priority wins,
    /// ties break by registration order.
    pub fn best_agent(&self, capability: &str) -> Option<&Capability> {
        let offers = self.capabilities.get(capability)?;
        let mut best: Option<&Capability> = None;
        for offer in offers.iter().filter(|o| o.available) {
            match best {
                Some(current) if offer.priority <= current.priority => {}
                _ => best = Some(offer),
            }
        }
        best
    }

    /// Capability names with at least one available offer.
    pub fn available_capabilities(&self) -> &HashSet<String> {
        &self.available
    }

    /// All dependency rows, in registration order.
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Number of distinct capability names.
    pub fn capability_count(&self) -> usize {
        self.capabilities.len()
    }
}

/// Read-mostly capability index over an [`AgentStore`].
///
/// There is no background timer: callers (or a periodic task they own)
/// invoke `refresh()` explicitly, and tests inject a fixed snapshot via
/// `with_snapshot`. Registration and unregistration write through to the
/// store and then refresh, so the snapshot never lags a local mutation.
pub struct CapabilityRegistry {
    store: Arc<dyn AgentStore>,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl CapabilityRegistry {
    /// Create a registry with an empty snapshot; call `refresh()` to load.
    pub fn new(store: Arc<dyn AgentStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
        }
    }

    /// Create a registry pre-seeded with a fixed snapshot (tests).
    pub fn with_snapshot(store: Arc<dyn AgentStore>, snapshot: RegistrySnapshot) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Rebuild the snapshot from the store and swap it in atomically.
    pub async fn refresh(&self) -> Result<()> {
        let agents = self.store.load_agents().await?;
        let next = Arc::new(RegistrySnapshot::from_agents(&agents));
        debug!(
            agents = agents.len(),
            capabilities = next.capability_count(),
            "Capability registry refreshed"
        );
        if let Ok(mut guard) = self.snapshot.write() {
            *guard = next;
        }
        Ok(())
    }

    /// The current snapshot. Cheap to call; the returned view stays
    /// consistent for as long as the caller holds it.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Register an agent and refresh.
    pub async fn register_agent(&self, record: AgentRecord) -> Result<()> {
        info!(agent_id = %record.agent_id, "Registering agent");
        self.store.register_agent(record).await?;
        self.refresh().await
    }

    /// Unregister an agent and refresh.
    pub async fn unregister_agent(&self, agent_id: &str) -> Result<()> {
        info!(agent_id = %agent_id, "Unregistering agent");
        self.store.unregister_agent(agent_id.to_string()).await?;
        self.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::Mutex;

    /// Minimal in-memory agent store for registry tests.
    #[derive(Default)]
    struct FakeAgentStore {
        agents: Mutex<Vec<AgentRecord>>,
    }

    impl AgentStore for FakeAgentStore {
        fn load_agents(&self) -> BoxFuture<'_, Result<Vec<AgentRecord>>> {
            Box::pin(async move { Ok(self.agents.lock().unwrap().clone()) })
        }

        fn register_agent(&self, record: AgentRecord) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                let mut agents = self.agents.lock().unwrap();
                agents.retain(|a| a.agent_id != record.agent_id);
                agents.push(record);
                Ok(())
            })
        }

        fn unregister_agent(&self, agent_id: String) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.agents
                    .lock()
                    .unwrap()
                    .retain(|a| a.agent_id != agent_id);
                Ok(())
            })
        }
    }

    fn record(agent_id: &str, capability: &str, priority: i32, available: bool) -> AgentRecord {
        let mut cap = Capability::new(agent_id, capability).with_priority(priority);
        if !available {
            cap = cap.unavailable();
        }
        AgentRecord {
            agent_id: agent_id.to_string(),
            capabilities: vec![cap],
            dependencies: vec![],
        }
    }

    #[test]
    fn test_best_agent_priority() {
        let snapshot = RegistrySnapshot::from_agents(&[
            record("low", "scan", 1, true),
            record("high", "scan", 9, true),
            record("mid", "scan", 5, true),
        ]);
        assert_eq!(snapshot.best_agent("scan").unwrap().agent_id, "high");
    }

    #[test]
    fn test_best_agent_tie_registration_order() {
        let snapshot = RegistrySnapshot::from_agents(&[
            record("first", "scan", 5, true),
            record("second", "scan", 5, true),
        ]);
        assert_eq!(snapshot.best_agent("scan").unwrap().agent_id, "first");
    }

    #[test]
    fn test_best_agent_skips_unavailable() {
        let snapshot = RegistrySnapshot::from_agents(&[
            record("down", "scan", 9, false),
            record("up", "scan", 1, true),
        ]);
        assert_eq!(snapshot.best_agent("scan").unwrap().agent_id, "up");
        assert!(snapshot.best_agent("missing").is_none());
    }

    #[test]
    fn test_available_set_excludes_fully_unavailable() {
        let snapshot = RegistrySnapshot::from_agents(&[
            record("a", "scan", 0, false),
            record("b", "report", 0, true),
        ]);
        assert!(!snapshot.available_capabilities().contains("scan"));
        assert!(snapshot.available_capabilities().contains("report"));
    }

    #[tokio::test]
    async fn test_register_triggers_refresh() {
        let store = Arc::new(FakeAgentStore::default());
        let registry = CapabilityRegistry::new(store);

        assert!(registry.snapshot().best_agent("scan").is_none());

        registry
            .register_agent(record("scanner", "scan", 0, true))
            .await
            .unwrap();
        assert_eq!(
            registry.snapshot().best_agent("scan").unwrap().agent_id,
            "scanner"
        );

        registry.unregister_agent("scanner").await.unwrap();
        assert!(registry.snapshot().best_agent("scan").is_none());
    }

    #[tokio::test]
    async fn test_snapshot_is_point_in_time() {
        let store = Arc::new(FakeAgentStore::default());
        let registry = CapabilityRegistry::new(store);
        registry
            .register_agent(record("scanner", "scan", 0, true))
            .await
            .unwrap();

        // A held snapshot is unaffected by later refreshes
        let held = registry.snapshot();
        registry.unregister_agent("scanner").await.unwrap();

        assert!(held.best_agent("scan").is_some());
        assert!(registry.snapshot().best_agent("scan").is_none());
    }
}
