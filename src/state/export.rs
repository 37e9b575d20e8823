//! Snapshot export/import of the durable room store.
//!
//! Lets the relay server survive restarts: late joiners after a restart still
//! find the last session and roster of their room.

use super::AppState;
use crate::channel::Versioned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Schema version for snapshot format compatibility
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Serializable copy of every durable key.
///
/// Broadcast channels and subscribers are runtime-only and not included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub schema_version: u32,
    /// Export timestamp (ISO8601)
    pub exported_at: String,
    pub entries: HashMap<String, Versioned>,
}

impl StoreSnapshot {
    pub fn new(entries: HashMap<String, Versioned>) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            exported_at: chrono::Utc::now().to_rfc3339(),
            entries,
        }
    }

    /// Validate the snapshot before import
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version > SNAPSHOT_SCHEMA_VERSION {
            return Err(format!(
                "Snapshot schema version {} is newer than supported version {}",
                self.schema_version, SNAPSHOT_SCHEMA_VERSION
            ));
        }
        if let Some((key, _)) = self.entries.iter().find(|(_, v)| v.version == 0) {
            return Err(format!("Key '{}' has invalid version 0", key));
        }
        Ok(())
    }

    /// Load a snapshot from disk; `Ok(None)` if the file does not exist
    pub async fn load(path: &Path) -> std::io::Result<Option<Self>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write to a sibling temp file, then rename over the target
    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await
    }
}

impl AppState {
    pub async fn export_snapshot(&self) -> StoreSnapshot {
        StoreSnapshot::new(self.store.read().await.clone())
    }

    /// Replace the store contents with a snapshot, returning the number of keys
    pub async fn import_snapshot(&self, snapshot: StoreSnapshot) -> Result<usize, String> {
        snapshot.validate()?;
        let count = snapshot.entries.len();
        *self.store.write().await = snapshot.entries;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SharedStateChannel;
    use serde_json::json;

    #[tokio::test]
    async fn test_snapshot_written_on_every_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rooms.json");

        let state = AppState::with_data_path(path.clone()).await;
        state.write("rooms/a/meta", json!({"owner": "Alice"})).await.unwrap();
        state.write("rooms/a/meta", json!({"owner": "Bob"})).await.unwrap();

        let snapshot = StoreSnapshot::load(&path).await.unwrap().unwrap();
        assert_eq!(snapshot.schema_version, SNAPSHOT_SCHEMA_VERSION);
        let meta = &snapshot.entries["rooms/a/meta"];
        assert_eq!(meta.version, 2);
        assert_eq!(meta.value["owner"], "Bob");
    }

    #[tokio::test]
    async fn test_restart_restores_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rooms.json");

        {
            let state = AppState::with_data_path(path.clone()).await;
            state.write("k", json!(1)).await.unwrap();
            state.write("k", json!(2)).await.unwrap();
        }

        let restored = AppState::with_data_path(path).await;
        let stored = restored.read("k").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);

        // Versions continue, so CAS against the old version still works
        assert!(restored
            .compare_and_swap("k", Some(2), json!(3))
            .await
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_leave_latest_snapshot_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rooms.json");
        let state = std::sync::Arc::new(AppState::with_data_path(path.clone()).await);

        for round in 0..10 {
            let writers: Vec<_> = (0..16)
                .map(|i| {
                    let state = state.clone();
                    tokio::spawn(async move {
                        state.write(&format!("k{}", i), json!(round)).await.unwrap();
                    })
                })
                .collect();
            for writer in writers {
                writer.await.unwrap();
            }

            let on_disk = StoreSnapshot::load(&path).await.unwrap().unwrap();
            assert_eq!(
                on_disk.entries,
                state.export_snapshot().await.entries,
                "snapshot stale after round {}",
                round
            );
        }
    }

    #[tokio::test]
    async fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::with_data_path(dir.path().join("absent.json")).await;
        assert!(state.store.read().await.is_empty());
    }

    #[test]
    fn test_validation_future_schema() {
        let mut snapshot = StoreSnapshot::new(HashMap::new());
        snapshot.schema_version = SNAPSHOT_SCHEMA_VERSION + 1;

        let result = snapshot.validate();
        assert!(result.unwrap_err().contains("newer than supported"));
    }

    #[test]
    fn test_validation_zero_version() {
        let mut entries = HashMap::new();
        entries.insert(
            "k".to_string(),
            Versioned {
                version: 0,
                value: json!(null),
            },
        );
        let result = StoreSnapshot::new(entries).validate();
        assert!(result.unwrap_err().contains("invalid version"));
    }
}
