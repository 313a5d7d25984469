//! Host-side backends shared by every extension: a key-value store and an
//! event hub. Extensions only ever see their own storage map and events
//! named `<id>:<event>`.

use linch_core::{EventBus, ExtensionId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Build the namespaced event name `<id>:<event>`.
pub fn namespaced(extension: &ExtensionId, name: &str) -> String {
    format!("{}:{}", extension, name)
}

/// In-memory key-value backend, one map per extension.
#[derive(Clone, Default)]
pub struct SharedStore {
    inner: Arc<RwLock<HashMap<ExtensionId, HashMap<String, Value>>>>,
}

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, extension: &ExtensionId, key: &str) -> Option<Value> {
        self.inner
            .read()
            .get(extension)
            .and_then(|entries| entries.get(key))
            .cloned()
    }

    pub fn set(&self, extension: &ExtensionId, key: &str, value: Value) {
        self.inner
            .write()
            .entry(extension.clone())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn delete(&self, extension: &ExtensionId, key: &str) -> bool {
        let mut map = self.inner.write();
        let Some(entries) = map.get_mut(extension) else {
            return false;
        };
        let removed = entries.remove(key).is_some();
        if entries.is_empty() {
            map.remove(extension);
        }
        removed
    }

    /// Remove every key of one extension. Returns how many were removed.
    pub fn clear(&self, extension: &ExtensionId) -> usize {
        self.inner
            .write()
            .remove(extension)
            .map_or(0, |entries| entries.len())
    }

    /// Keys of one extension, sorted.
    pub fn keys(&self, extension: &ExtensionId) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .read()
            .get(extension)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Approximate bytes held by one extension (keys plus serialized values).
    pub fn footprint(&self, extension: &ExtensionId) -> u64 {
        self.inner
            .read()
            .get(extension)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(k, v)| (k.len() + v.to_string().len()) as u64)
                    .sum()
            })
            .unwrap_or(0)
    }
}

/// An event published on the hub. `name` is already namespaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubEvent {
    pub source: ExtensionId,
    pub name: String,
    pub payload: Value,
}

/// Broadcast hub for extension events.
#[derive(Clone, Default)]
pub struct EventHub {
    bus: EventBus<HubEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `<source>:<event>`.
    pub fn emit(&self, source: &ExtensionId, event: &str, payload: Value) {
        self.bus.publish(HubEvent {
            source: source.clone(),
            name: namespaced(source, event),
            payload,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn store_is_namespaced_per_extension() {
        let store = SharedStore::new();
        let a = ExtensionId::from("a");
        let b = ExtensionId::from("b");
        store.set(&a, "k", json!(1));
        store.set(&b, "k", json!(2));
        assert_eq!(store.get(&a, "k"), Some(json!(1)));
        assert_eq!(store.get(&b, "k"), Some(json!(2)));

        assert_eq!(store.clear(&a), 1);
        assert!(store.get(&a, "k").is_none());
        assert_eq!(store.keys(&b), vec!["k"]);
    }

    #[test]
    fn prefix_does_not_leak_between_similar_ids() {
        let store = SharedStore::new();
        store.set(&"ab".into(), "x", json!(true));
        store.set(&"a".into(), "b:x", json!(false));
        assert_eq!(store.keys(&"ab".into()), vec!["x"]);
        assert_eq!(store.keys(&"a".into()), vec!["b:x"]);
    }

    #[test]
    fn colon_in_key_cannot_reach_another_extension() {
        let store = SharedStore::new();
        let a = ExtensionId::from("a");
        let ab = ExtensionId::from("a:b");
        store.set(&ab, "x", json!("owned by a:b"));

        assert!(store.get(&a, "b:x").is_none());
        assert!(store.keys(&a).is_empty());
        assert_eq!(store.footprint(&a), 0);
        assert_eq!(store.clear(&a), 0);
        assert_eq!(store.get(&ab, "x"), Some(json!("owned by a:b")));
    }

    #[test]
    fn delete_drops_empty_namespace() {
        let store = SharedStore::new();
        let a = ExtensionId::from("a");
        store.set(&a, "k", json!(1));
        assert!(store.delete(&a, "k"));
        assert!(!store.delete(&a, "k"));
        assert_eq!(store.footprint(&a), 0);
    }

    #[tokio::test]
    async fn hub_namespaces_event_names() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();
        hub.emit(&"blog".into(), "post_created", json!({"id": 1}));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.name, "blog:post_created");
        assert_eq!(ev.source.as_str(), "blog");
    }
}
