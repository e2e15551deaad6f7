pub mod budget;
pub mod classify;
pub mod executor;
pub mod postexploit;
pub mod rank;
pub mod search;
pub mod tree;

pub use budget::{BudgetDecision, TreeBudget};
pub use classify::{
    DiscoveryAnalysis, DiscoveryClassifier, ExploitAnalysis, ExploitClassifier,
    LlmDiscoveryClassifier, LlmExploitClassifier, PatternDiscoveryClassifier,
    PatternExploitClassifier,
};
pub use executor::AttackTreeExecutor;
pub use postexploit::{DefaultPostExploitPlanner, LlmPostExploitPlanner, PostExploitPlanner};
pub use rank::{KeywordModuleRanker, LlmModuleRanker, ModuleRanker, RankedModule};
pub use search::{ModuleSearch, StaticModuleIndex};
pub use tree::{AttackTreeNode, NodeAnalysis, TreeNodeStatus, TreeReport, TreeStats};
