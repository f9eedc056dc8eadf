//! Best-effort snapshot persistence.
//!
//! The persisted layout is a single file holding the replica's raw
//! full-state update bytes. No header, no versioning; the CRDT encoding
//! carries its own structure. A corrupt file is logged and ignored at
//! load time and the server starts with an empty document.
//!
//! Saves run on a dedicated task fed by a depth-one signal channel, so
//! the frame path never waits on disk and a burst of edits collapses
//! into few writes. Failures are logged and never affect live traffic.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::fs;
use tokio::sync::mpsc;

use crate::document::Replica;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("snapshot io: {0}")]
    Io(#[from] io::Error),
}

/// The snapshot file sink.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads a prior snapshot into the replica as a single update.
    /// Returns whether anything was loaded; a missing, empty, or corrupt
    /// file leaves the replica untouched.
    pub async fn load(&self, replica: &Replica) -> Result<bool, PersistenceError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::info!("no snapshot at {}", self.path.display());
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };
        if bytes.is_empty() {
            log::info!("empty snapshot at {}, ignoring", self.path.display());
            return Ok(false);
        }
        match replica.apply_update(&bytes).await {
            Ok(()) => {
                log::info!(
                    "loaded snapshot ({} bytes) from {}",
                    bytes.len(),
                    self.path.display()
                );
                Ok(true)
            }
            Err(err) => {
                log::warn!(
                    "corrupt snapshot at {} ignored: {err}",
                    self.path.display()
                );
                Ok(false)
            }
        }
    }

    /// Encodes the replica's full state and atomically replaces the
    /// snapshot file (write to a sibling temp file, then rename).
    pub async fn save(&self, replica: &Replica) -> Result<(), PersistenceError> {
        let state = replica.snapshot_full_state().await;
        let tmp = {
            let mut os = self.path.clone().into_os_string();
            os.push(".tmp");
            PathBuf::from(os)
        };
        fs::write(&tmp, &state).await?;
        fs::rename(&tmp, &self.path).await?;
        log::debug!(
            "saved snapshot ({} bytes) to {}",
            state.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// Handle used by the frame path to request a snapshot write. Requests
/// coalesce: one already pending absorbs any number of new ones.
#[derive(Clone)]
pub struct SaveHandle {
    tx: mpsc::Sender<()>,
}

impl SaveHandle {
    pub fn request(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Spawns the background saver task.
pub fn spawn_saver(store: Arc<SnapshotStore>, replica: Arc<Replica>) -> SaveHandle {
    let (tx, mut rx) = mpsc::channel(1);
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            if let Err(err) = store.save(&replica).await {
                log::warn!("snapshot save failed: {err}");
            }
        }
    });
    SaveHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Duration};
    use yrs::{Doc, ReadTxn, StateVector, Text, Transact, WriteTxn};

    fn edit_update(text: &str) -> Vec<u8> {
        let doc = Doc::with_client_id(7);
        {
            let mut txn = doc.transact_mut();
            let branch = txn.get_or_insert_text("quill");
            branch.insert(&mut txn, 0, text);
        }
        let update = doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default());
        update
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("doc.bin"));
        let replica = Replica::new("quill");
        assert!(!store.load(&replica).await.unwrap());
        assert_eq!(replica.text_content().await, "");
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("doc.bin"));

        let replica = Replica::new("quill");
        replica.apply_update(&edit_update("persisted")).await.unwrap();
        store.save(&replica).await.unwrap();

        let restored = Replica::new("quill");
        assert!(store.load(&restored).await.unwrap());
        assert_eq!(restored.text_content().await, "persisted");
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.bin");
        tokio::fs::write(&path, b"not a crdt update").await.unwrap();

        let store = SnapshotStore::new(&path);
        let replica = Replica::new("quill");
        assert!(!store.load(&replica).await.unwrap());
        assert_eq!(replica.text_content().await, "");
    }

    #[tokio::test]
    async fn test_empty_snapshot_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.bin");
        tokio::fs::write(&path, b"").await.unwrap();

        let store = SnapshotStore::new(&path);
        let replica = Replica::new("quill");
        assert!(!store.load(&replica).await.unwrap());
    }

    #[tokio::test]
    async fn test_save_replaces_prior_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("doc.bin"));

        let replica = Replica::new("quill");
        replica.apply_update(&edit_update("v1")).await.unwrap();
        store.save(&replica).await.unwrap();
        replica.apply_update(&edit_update("v2")).await.unwrap();
        store.save(&replica).await.unwrap();

        let restored = Replica::new("quill");
        store.load(&restored).await.unwrap();
        assert_eq!(
            restored.text_content().await,
            replica.text_content().await
        );
    }

    #[tokio::test]
    async fn test_saver_task_writes_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.bin");
        let store = Arc::new(SnapshotStore::new(&path));
        let replica = Arc::new(Replica::new("quill"));
        replica.apply_update(&edit_update("queued")).await.unwrap();

        let handle = spawn_saver(store.clone(), replica.clone());
        handle.request();

        for _ in 0..50 {
            if path.exists() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        let restored = Replica::new("quill");
        assert!(store.load(&restored).await.unwrap());
        assert_eq!(restored.text_content().await, "queued");
    }
}
