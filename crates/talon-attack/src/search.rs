use futures::future::BoxFuture;

use talon_core::error::Result;
use talon_core::types::ModuleSpec;

/// Source of candidate exploit modules for a search query.
///
/// Backed by whatever module inventory the deployment has (an exploit
/// framework's module list, an offline index); the executor only needs
/// token-level relevance, exact ranking happens later.
pub trait ModuleSearch: Send + Sync + 'static {
    fn search(&self, query: String, limit: usize) -> BoxFuture<'_, Result<Vec<ModuleSpec>>>;
}

/// Split free text into lowercase tokens worth matching on.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_string())
        .collect()
}

/// In-memory module index with token matching. Used by tests and by
/// offline runs where no live framework inventory is reachable.
#[derive(Debug, Clone, Default)]
pub struct StaticModuleIndex {
    modules: Vec<ModuleSpec>,
}

impl StaticModuleIndex {
    pub fn new(modules: Vec<ModuleSpec>) -> Self {
        Self { modules }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    fn matches(&self, query: &str, limit: usize) -> Vec<ModuleSpec> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, &ModuleSpec)> = self
            .modules
            .iter()
            .filter_map(|module| {
                let path = module.path.to_lowercase();
                let hits = tokens.iter().filter(|t| path.contains(t.as_str())).count();
                (hits > 0).then_some((hits, module))
            })
            .collect();

        scored.sort_by(|(ha, ma), (hb, mb)| hb.cmp(ha).then(ma.path.cmp(&mb.path)));
        scored
            .into_iter()
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl ModuleSearch for StaticModuleIndex {
    fn search(&self, query: String, limit: usize) -> BoxFuture<'_, Result<Vec<ModuleSpec>>> {
        Box::pin(async move { Ok(self.matches(&query, limit)) })
    }
}
