//! Durable research-state storage.
//!
//! Every stage transition is persisted before the engine acts on it, so a
//! crash resumes at the last completed stage. Writes carry an optimistic
//! version check: a writer holding a stale snapshot is rejected with
//! `StorageError::StaleWrite` instead of silently clobbering newer state.

use crate::error::StorageError;
use crate::persistence::{atomic_write_json, load_json};
use crate::state::{ResearchState, RunStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Storage backend for research run state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a run snapshot.
    ///
    /// The incoming snapshot must be based on the currently stored version;
    /// on success the state's version is bumped. A snapshot older than or
    /// concurrent with the stored one is rejected with `StaleWrite`.
    async fn save(&self, state: &mut ResearchState) -> Result<(), StorageError>;

    /// Load a run by id.
    async fn load(&self, id: Uuid) -> Result<ResearchState, StorageError>;

    /// List known runs, most recently updated first.
    async fn list(&self) -> Result<Vec<RunStatus>, StorageError>;
}

fn check_version(
    id: Uuid,
    incoming: u64,
    stored: Option<u64>,
) -> Result<(), StorageError> {
    if let Some(stored) = stored
        && incoming <= stored
    {
        return Err(StorageError::StaleWrite {
            id,
            incoming,
            stored,
        });
    }
    Ok(())
}

/// File-backed store: one JSON snapshot per run under a directory, written
/// atomically (tmp file + rename).
pub struct JsonFileStore {
    dir: PathBuf,
    /// Serializes save operations so version check + write is atomic.
    write_lock: RwLock<()>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: RwLock::new(()),
        }
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn load_sync(path: &Path) -> Result<Option<ResearchState>, StorageError> {
        load_json(path).map_err(|e| StorageError::LoadFailed {
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn save(&self, state: &mut ResearchState) -> Result<(), StorageError> {
        let _guard = self.write_lock.write().await;
        let path = self.path_for(state.id);

        let stored_version = Self::load_sync(&path)?.map(|s| s.version);
        let incoming = state.version + 1;
        check_version(state.id, incoming, stored_version)?;

        state.version = incoming;
        atomic_write_json(&path, state).map_err(|e| StorageError::WriteFailed {
            path: path.clone(),
            message: e.to_string(),
        })?;
        debug!(run_id = %state.id, version = state.version, status = %state.status, "persisted run state");
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<ResearchState, StorageError> {
        let _guard = self.write_lock.read().await;
        Self::load_sync(&self.path_for(id))?.ok_or(StorageError::NotFound { id })
    }

    async fn list(&self) -> Result<Vec<RunStatus>, StorageError> {
        let _guard = self.write_lock.read().await;
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::LoadFailed {
                    message: e.to_string(),
                });
            }
        };

        let mut states = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::LoadFailed {
                message: e.to_string(),
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Skip unreadable snapshots rather than failing the listing.
            if let Ok(Some(state)) = Self::load_sync(&path) {
                states.push(state);
            }
        }
        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(states.iter().map(RunStatus::from).collect())
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    runs: Arc<RwLock<HashMap<Uuid, ResearchState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save(&self, state: &mut ResearchState) -> Result<(), StorageError> {
        let mut runs = self.runs.write().await;
        let stored_version = runs.get(&state.id).map(|s| s.version);
        let incoming = state.version + 1;
        check_version(state.id, incoming, stored_version)?;

        state.version = incoming;
        runs.insert(state.id, state.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<ResearchState, StorageError> {
        self.runs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound { id })
    }

    async fn list(&self) -> Result<Vec<RunStatus>, StorageError> {
        let runs = self.runs.read().await;
        let mut states: Vec<&ResearchState> = runs.values().collect();
        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(states.into_iter().map(RunStatus::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thesis::{Pillar, Thesis};
    use tempfile::TempDir;

    fn state() -> ResearchState {
        let thesis = Thesis {
            statement: "Acme compounds".into(),
            company: "Acme".into(),
            website: None,
            pillars: vec![Pillar::new("Growth", 1.0, vec!["How fast?".into()])],
        };
        ResearchState::new(thesis, 3)
    }

    #[tokio::test]
    async fn test_file_store_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());

        let mut state = state();
        store.save(&mut state).await.unwrap();
        assert_eq!(state.version, 1);

        let loaded = store.load(state.id).await.unwrap();
        assert_eq!(loaded.id, state.id);
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.thesis.company, "Acme");
    }

    #[tokio::test]
    async fn test_file_store_version_advances() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());

        let mut state = state();
        store.save(&mut state).await.unwrap();
        store.save(&mut state).await.unwrap();
        store.save(&mut state).await.unwrap();
        assert_eq!(state.version, 3);
    }

    #[tokio::test]
    async fn test_file_store_rejects_stale_write() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());

        let mut state = state();
        store.save(&mut state).await.unwrap();

        // A second writer based on the same initial snapshot.
        let mut stale = store.load(state.id).await.unwrap();
        store.save(&mut state).await.unwrap(); // now stored version 2

        let err = store.save(&mut stale).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::StaleWrite {
                incoming: 2,
                stored: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_file_store_load_missing() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        let err = store.load(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_file_store_list_empty_dir_missing() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("never-created"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_list_most_recent_first() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());

        let mut first = state();
        store.save(&mut first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut second = state();
        store.save(&mut second).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].run_id, second.id);
    }

    #[tokio::test]
    async fn test_memory_store_stale_write() {
        let store = MemoryStore::new();
        let mut state = state();
        store.save(&mut state).await.unwrap();

        let mut stale = store.load(state.id).await.unwrap();
        store.save(&mut state).await.unwrap();
        assert!(store.save(&mut stale).await.is_err());
    }

    #[tokio::test]
    async fn test_crash_recovery_snapshot_survives() {
        // Simulate a crash: drop the store, reopen over the same directory.
        let dir = TempDir::new().unwrap();
        let id;
        {
            let store = JsonFileStore::new(dir.path());
            let mut state = state();
            state
                .advance(crate::state::ResearchStatus::InterpretingThesis)
                .unwrap();
            store.save(&mut state).await.unwrap();
            id = state.id;
        }
        let reopened = JsonFileStore::new(dir.path());
        let recovered = reopened.load(id).await.unwrap();
        assert_eq!(
            recovered.status,
            crate::state::ResearchStatus::InterpretingThesis
        );
    }
}
