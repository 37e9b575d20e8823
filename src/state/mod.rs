pub mod export;

use crate::channel::{ChannelResult, SharedStateChannel, Versioned};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Mutex as AsyncMutex, RwLock};

/// Capacity of each key/topic broadcast channel
const CHANNEL_CAPACITY: usize = 100;

/// Shared relay state: the durable room store plus the pub/sub fan-out.
///
/// Implements [`SharedStateChannel`] directly, so in-process replicas and
/// WebSocket clients see the same store.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RwLock<HashMap<String, Versioned>>>,
    /// Durable-write notifications per key
    key_watchers: Arc<Mutex<HashMap<String, broadcast::Sender<Value>>>>,
    /// Best-effort topics
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<Value>>>>,
    /// Snapshot file written after each durable write
    data_path: Option<PathBuf>,
    /// Serializes export + save so an older snapshot never lands last
    persist_lock: Arc<AsyncMutex<()>>,
}

type Senders = Mutex<HashMap<String, broadcast::Sender<Value>>>;

impl AppState {
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
            key_watchers: Arc::new(Mutex::new(HashMap::new())),
            topics: Arc::new(Mutex::new(HashMap::new())),
            data_path: None,
            persist_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Create a store persisted to `path`, importing an existing snapshot if present
    pub async fn with_data_path(path: PathBuf) -> Self {
        let state = Self {
            data_path: Some(path.clone()),
            ..Self::new()
        };

        match export::StoreSnapshot::load(&path).await {
            Ok(Some(snapshot)) => match state.import_snapshot(snapshot).await {
                Ok(count) => tracing::info!("Restored {} keys from {}", count, path.display()),
                Err(e) => tracing::error!("Ignoring snapshot {}: {}", path.display(), e),
            },
            Ok(None) => tracing::info!("No snapshot at {}, starting empty", path.display()),
            Err(e) => tracing::error!("Failed to read snapshot {}: {}", path.display(), e),
        }
        state
    }

    fn lock(map: &Senders) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<Value>>> {
        map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe under the map lock, sweeping senders nobody listens to anymore
    fn subscribe(map: &Senders, name: &str) -> broadcast::Receiver<Value> {
        let mut map = Self::lock(map);
        map.retain(|_, tx| tx.receiver_count() > 0);
        map.entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send to `name` if anyone listens; drop the entry once nobody does
    fn send(map: &Senders, name: &str, value: Value) -> bool {
        let mut map = Self::lock(map);
        let Some(tx) = map.get(name) else {
            return false;
        };
        if tx.send(value).is_ok() {
            return true;
        }
        map.remove(name);
        false
    }

    fn notify(&self, key: &str, value: Value) {
        // No receivers connected is fine
        Self::send(&self.key_watchers, key, value);
    }

    /// Number of live key watchers and topics
    pub fn subscription_count(&self) -> usize {
        Self::lock(&self.key_watchers).len() + Self::lock(&self.topics).len()
    }

    /// Persist the store after a write (best-effort)
    async fn persist(&self) {
        let Some(path) = &self.data_path else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.export_snapshot().await;
        if let Err(e) = snapshot.save(path).await {
            tracing::warn!("Failed to persist snapshot to {}: {}", path.display(), e);
        }
    }

    async fn upsert(&self, key: &str, value: Value) -> u64 {
        let version = {
            let mut store = self.store.write().await;
            let version = store.get(key).map_or(1, |v| v.version + 1);
            store.insert(
                key.to_string(),
                Versioned {
                    version,
                    value: value.clone(),
                },
            );
            version
        };
        tracing::debug!(key, version, "Durable write");
        self.notify(key, value);
        self.persist().await;
        version
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStateChannel for AppState {
    async fn read(&self, key: &str) -> ChannelResult<Option<Versioned>> {
        Ok(self.store.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: Value) -> ChannelResult<u64> {
        Ok(self.upsert(key, value).await)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> ChannelResult<bool> {
        let version = {
            let mut store = self.store.write().await;
            let current = store.get(key).map(|v| v.version);
            if current != expected {
                tracing::debug!(key, ?current, ?expected, "Compare-and-swap rejected");
                return Ok(false);
            }
            let version = current.map_or(1, |v| v + 1);
            store.insert(
                key.to_string(),
                Versioned {
                    version,
                    value: value.clone(),
                },
            );
            version
        };
        tracing::debug!(key, version, "Compare-and-swap applied");
        self.notify(key, value);
        self.persist().await;
        Ok(true)
    }

    fn subscribe_key(&self, key: &str) -> broadcast::Receiver<Value> {
        Self::subscribe(&self.key_watchers, key)
    }

    async fn publish(&self, topic: &str, msg: Value) {
        if !Self::send(&self.topics, topic, msg) {
            tracing::debug!(topic, "Published with no subscribers");
        }
    }

    fn subscribe_topic(&self, topic: &str) -> broadcast::Receiver<Value> {
        Self::subscribe(&self.topics, topic)
    }
}
