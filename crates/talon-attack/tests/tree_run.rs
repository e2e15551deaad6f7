//! Whole-tree runs with AI-assisted seams wired in, degrading to the
//! deterministic fallbacks when the provider is unreachable.

use std::sync::Arc;

use futures::future::BoxFuture;

use talon_attack::{
    AttackTreeExecutor, LlmDiscoveryClassifier, LlmExploitClassifier, LlmModuleRanker,
    StaticModuleIndex, TreeNodeStatus,
};
use talon_core::audit::AuditLog;
use talon_core::config::AttackTreeConfig;
use talon_core::error::Result;
use talon_core::traits::{CompletionClient, ToolRunner};
use talon_core::types::{
    ChatMessage, Completion, CompletionOptions, ExecutionOutcome, ModuleSpec, ModuleType, Target,
};

/// Provider that is down for the whole run.
struct DeadProvider;

impl CompletionClient for DeadProvider {
    fn complete(
        &self,
        _options: CompletionOptions,
        _messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<Completion>> {
        Box::pin(async move {
            Err(talon_core::TalonError::Provider(
                "connection refused".into(),
            ))
        })
    }
}

/// Tool runner that answers by module path.
struct TableRunner {
    module_type: ModuleType,
    rows: Vec<(&'static str, ExecutionOutcome)>,
    default: ExecutionOutcome,
}

impl ToolRunner for TableRunner {
    fn module_type(&self) -> ModuleType {
        self.module_type
    }

    fn execute(
        &self,
        module: ModuleSpec,
        _target: Target,
    ) -> BoxFuture<'_, Result<ExecutionOutcome>> {
        Box::pin(async move {
            Ok(self
                .rows
                .iter()
                .find(|(path, _)| *path == module.path)
                .map(|(_, outcome)| outcome.clone())
                .unwrap_or_else(|| self.default.clone()))
        })
    }
}

#[tokio::test]
async fn test_full_run_with_dead_provider_degrades_to_patterns() {
    let provider: Arc<dyn CompletionClient> = Arc::new(DeadProvider);
    let options = CompletionOptions::default();
    let (audit, sink) = AuditLog::in_memory();

    let aux = TableRunner {
        module_type: ModuleType::Auxiliary,
        rows: vec![(
            "scanner/smb/smb_version",
            ExecutionOutcome::success("Host 10.0.0.5: Samba 4.6.2 (protocol SMB 2.1)"),
        )],
        default: ExecutionOutcome::failure("connection refused", 1),
    };
    let exploit = TableRunner {
        module_type: ModuleType::Exploit,
        rows: vec![(
            "linux/samba/is_known_pipename",
            ExecutionOutcome::success("[*] Meterpreter session 1 opened (tcp)"),
        )],
        default: ExecutionOutcome::failure("Exploit completed, but no session was created", 1),
    };
    let post = TableRunner {
        module_type: ModuleType::Post,
        rows: vec![],
        default: ExecutionOutcome::success("collected host data"),
    };

    let config = AttackTreeConfig {
        max_depth: 3,
        max_total_executions: 10,
        max_children_per_node: 2,
        max_post_exploit_scans: 2,
    };

    let executor = AttackTreeExecutor::new(config, audit.clone())
        .with_runner(Arc::new(aux))
        .with_runner(Arc::new(exploit))
        .with_runner(Arc::new(post))
        .with_search(Arc::new(StaticModuleIndex::new(vec![
            ModuleSpec::new(ModuleType::Exploit, "linux/samba/is_known_pipename"),
            ModuleSpec::new(ModuleType::Exploit, "multi/samba/usermap_script"),
        ])))
        .with_discovery_classifier(Arc::new(
            LlmDiscoveryClassifier::new(provider.clone(), options.clone()).with_audit(audit.clone()),
        ))
        .with_exploit_classifier(Arc::new(
            LlmExploitClassifier::new(provider.clone(), options.clone()).with_audit(audit.clone()),
        ))
        .with_ranker(Arc::new(
            LlmModuleRanker::new(provider.clone(), options.clone()).with_audit(audit.clone()),
        ));

    let report = executor
        .run(
            vec![ModuleSpec::new(
                ModuleType::Auxiliary,
                "scanner/smb/smb_version",
            )],
            &Target::new("10.0.0.5").with_port(445),
        )
        .await;

    // The engine stayed fully functional on pattern fallbacks
    let root = &report.roots[0];
    assert_eq!(root.status, TreeNodeStatus::Branched);
    assert!(root.analysis.as_ref().unwrap().is_discovery);
    assert!(root
        .analysis
        .as_ref()
        .unwrap()
        .search_queries
        .iter()
        .any(|q| q.contains("samba 4.6")));
    assert_eq!(root.children.len(), 2);

    let session = report.successful_exploits();
    assert_eq!(session.len(), 1);
    assert_eq!(session[0].module.path, "linux/samba/is_known_pipename");
    assert_eq!(session[0].children.len(), 2);

    // Invariants: bounded executions, bounded depth, no module twice
    assert!(report.stats.total_executions <= 10);
    let mut seen = std::collections::HashSet::new();
    for node in report.flatten() {
        if node.execution.is_some() {
            assert!(node.depth <= 3);
            assert!(seen.insert(node.module.visit_key()), "module executed twice");
        }
    }

    // Every fallback decision hit the audit stream
    let messages = sink.messages();
    assert!(messages.iter().any(|m| m == "provider fallback used"));
    assert!(messages.iter().any(|m| m == "attack tree completed"));
}

#[tokio::test]
async fn test_run_against_quiet_host_terminates_without_branching() {
    let (audit, _) = AuditLog::in_memory();
    let aux = TableRunner {
        module_type: ModuleType::Auxiliary,
        rows: vec![],
        default: ExecutionOutcome::failure("host unreachable", 1),
    };

    let executor =
        AttackTreeExecutor::new(AttackTreeConfig::default(), audit).with_runner(Arc::new(aux));

    let report = executor
        .run(
            vec![
                ModuleSpec::new(ModuleType::Auxiliary, "scanner/smb/smb_version"),
                ModuleSpec::new(ModuleType::Auxiliary, "scanner/ssh/ssh_version"),
            ],
            &Target::new("10.0.0.99"),
        )
        .await;

    assert_eq!(report.stats.total_executions, 2);
    assert_eq!(report.stats.discoveries, 0);
    for root in &report.roots {
        assert_eq!(root.status, TreeNodeStatus::Analyzed);
        assert!(root.children.is_empty());
    }
}
