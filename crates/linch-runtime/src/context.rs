use linch_core::ExtensionId;
use linch_sandbox::shared::namespaced;
use linch_sandbox::{EventHub, HubEvent, SharedStore};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything an extension's hooks receive from the host.
#[derive(Clone)]
pub struct ExtensionContext {
    pub name: ExtensionId,
    pub permissions: Vec<String>,
    config: Arc<RwLock<Map<String, Value>>>,
    pub logger: ExtensionLogger,
    pub events: ExtensionEvents,
    pub storage: ExtensionStorage,
}

impl ExtensionContext {
    pub fn new(
        name: ExtensionId,
        permissions: Vec<String>,
        config: Map<String, Value>,
        store: SharedStore,
        hub: EventHub,
    ) -> Self {
        Self {
            logger: ExtensionLogger {
                extension: name.clone(),
            },
            events: ExtensionEvents::new(name.clone(), hub),
            storage: ExtensionStorage {
                extension: name.clone(),
                store,
            },
            config: Arc::new(RwLock::new(config)),
            permissions,
            name,
        }
    }

    /// Snapshot of the merged configuration.
    pub fn config(&self) -> Map<String, Value> {
        self.config.read().clone()
    }

    pub fn config_value(&self, key: &str) -> Option<Value> {
        self.config.read().get(key).cloned()
    }

    /// `config.enabled`, defaulting to true.
    pub fn is_enabled(&self) -> bool {
        self.config
            .read()
            .get("enabled")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    pub(crate) fn merge_config(&self, patch: Map<String, Value>) {
        let mut config = self.config.write();
        for (key, value) in patch {
            config.insert(key, value);
        }
    }
}

// ── Logger ─────────────────────────────────────────────────────

/// Logs through `tracing` with the extension id attached.
#[derive(Debug, Clone)]
pub struct ExtensionLogger {
    extension: ExtensionId,
}

impl ExtensionLogger {
    pub fn debug(&self, message: &str) {
        debug!(extension = %self.extension, "{}", message);
    }

    pub fn info(&self, message: &str) {
        info!(extension = %self.extension, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        warn!(extension = %self.extension, "{}", message);
    }

    pub fn error(&self, message: &str) {
        error!(extension = %self.extension, "{}", message);
    }
}

// ── Events ─────────────────────────────────────────────────────

/// Handle returned by [`ExtensionEvents::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Event API namespaced by extension id.
///
/// `emit("saved")` publishes `<id>:saved`. `on` accepts either a local name
/// (resolved to the extension's own namespace) or a fully qualified
/// `<other>:<event>` name.
#[derive(Clone)]
pub struct ExtensionEvents {
    extension: ExtensionId,
    hub: EventHub,
    listeners: Arc<Mutex<HashMap<ListenerId, JoinHandle<()>>>>,
    next_id: Arc<AtomicU64>,
}

impl ExtensionEvents {
    fn new(extension: ExtensionId, hub: EventHub) -> Self {
        Self {
            extension,
            hub,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn emit(&self, event: &str, payload: Value) {
        self.hub.emit(&self.extension, event, payload);
    }

    /// Register a listener. Must be called from within a tokio runtime.
    pub fn on<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: Fn(HubEvent) + Send + Sync + 'static,
    {
        let full_name = if event.contains(':') {
            event.to_string()
        } else {
            namespaced(&self.extension, event)
        };
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut rx = self.hub.subscribe();
        let extension = self.extension.clone();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) if ev.name == full_name => handler(ev),
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!(extension = %extension, skipped = n, "event listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.listeners.lock().insert(id, task);
        id
    }

    /// Remove a listener. Returns whether it existed.
    pub fn off(&self, id: ListenerId) -> bool {
        match self.listeners.lock().remove(&id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub(crate) fn off_all(&self) {
        for (_, task) in self.listeners.lock().drain() {
            task.abort();
        }
    }
}

// ── Storage ────────────────────────────────────────────────────

/// Key-value storage namespaced by extension id.
#[derive(Clone)]
pub struct ExtensionStorage {
    extension: ExtensionId,
    store: SharedStore,
}

impl ExtensionStorage {
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.store.get(&self.extension, key)
    }

    pub async fn set(&self, key: &str, value: Value) {
        self.store.set(&self.extension, key, value);
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.store.delete(&self.extension, key)
    }

    pub async fn clear(&self) -> usize {
        self.store.clear(&self.extension)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.store.keys(&self.extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn ctx(name: &str, store: SharedStore, hub: EventHub) -> ExtensionContext {
        ExtensionContext::new(name.into(), vec![], Map::new(), store, hub)
    }

    #[tokio::test]
    async fn storage_is_isolated_per_extension() {
        let store = SharedStore::new();
        let hub = EventHub::new();
        let a = ctx("a", store.clone(), hub.clone());
        let b = ctx("b", store, hub);

        a.storage.set("count", json!(1)).await;
        assert_eq!(a.storage.get("count").await, Some(json!(1)));
        assert_eq!(b.storage.get("count").await, None);
        assert_eq!(a.storage.keys().await, vec!["count"]);
        assert_eq!(a.storage.clear().await, 1);
    }

    #[tokio::test]
    async fn listeners_receive_namespaced_events() {
        let hub = EventHub::new();
        let a = ctx("a", SharedStore::new(), hub.clone());
        let b = ctx("b", SharedStore::new(), hub);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let id = b.events.on("a:ping", move |ev| {
            let _ = tx.send(ev.payload);
        });
        tokio::task::yield_now().await;

        a.events.emit("ping", json!("hello"));
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(json!("hello")));

        assert!(b.events.off(id));
        assert!(!b.events.off(id));
        assert_eq!(b.events.listener_count(), 0);
    }

    #[test]
    fn enabled_defaults_to_true() {
        let c = ctx("a", SharedStore::new(), EventHub::new());
        assert!(c.is_enabled());
        let mut patch = Map::new();
        patch.insert("enabled".into(), json!(false));
        c.merge_config(patch);
        assert!(!c.is_enabled());
    }
}
