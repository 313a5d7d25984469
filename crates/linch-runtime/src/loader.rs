use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::extension::ExtensionHooks;

/// Result of importing an extension's hooks module.
pub enum ImportOutcome {
    Loaded(Arc<dyn ExtensionHooks>),
    Failed(String),
}

/// Resolves a hooks entry path to an implementation.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn import_module(&self, path: &Path) -> ImportOutcome;
}

pub type HooksFactory = Arc<dyn Fn() -> Arc<dyn ExtensionHooks> + Send + Sync>;

/// Loader for hooks compiled into the host binary.
///
/// A key matches an entry path when the path equals it or ends with it, so
/// `"blog/dist/hooks.js"` resolves `/srv/extensions/blog/dist/hooks.js`.
/// Each import calls the factory again, giving a reloaded extension fresh
/// hook state.
#[derive(Default)]
pub struct StaticModuleLoader {
    modules: RwLock<Vec<(PathBuf, HooksFactory)>>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, key: impl Into<PathBuf>, factory: F)
    where
        F: Fn() -> Arc<dyn ExtensionHooks> + Send + Sync + 'static,
    {
        let key = key.into();
        debug!(key = %key.display(), "registering static hooks module");
        let mut modules = self.modules.write();
        modules.retain(|(existing, _)| existing != &key);
        modules.push((key, Arc::new(factory)));
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }

    fn resolve(&self, path: &Path) -> Option<HooksFactory> {
        self.modules
            .read()
            .iter()
            .find(|(key, _)| path == key.as_path() || path.ends_with(key))
            .map(|(_, factory)| Arc::clone(factory))
    }
}

#[async_trait]
impl ModuleLoader for StaticModuleLoader {
    async fn import_module(&self, path: &Path) -> ImportOutcome {
        match self.resolve(path) {
            Some(factory) => ImportOutcome::Loaded(factory()),
            None => ImportOutcome::Failed(format!("no module registered for {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::NoopHooks;

    #[tokio::test]
    async fn resolves_by_path_suffix() {
        let loader = StaticModuleLoader::new();
        loader.register("blog/dist/hooks.js", || Arc::new(NoopHooks) as Arc<dyn ExtensionHooks>);

        let hit = loader
            .import_module(Path::new("/srv/extensions/blog/dist/hooks.js"))
            .await;
        assert!(matches!(hit, ImportOutcome::Loaded(_)));

        let miss = loader
            .import_module(Path::new("/srv/extensions/shop/dist/hooks.js"))
            .await;
        match miss {
            ImportOutcome::Failed(reason) => assert!(reason.contains("shop")),
            ImportOutcome::Loaded(_) => panic!("unexpected hit"),
        }
    }

    #[test]
    fn re_registering_replaces() {
        let loader = StaticModuleLoader::new();
        loader.register("a.js", || Arc::new(NoopHooks) as Arc<dyn ExtensionHooks>);
        loader.register("a.js", || Arc::new(NoopHooks) as Arc<dyn ExtensionHooks>);
        assert_eq!(loader.len(), 1);
    }
}
