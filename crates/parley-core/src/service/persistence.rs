//! Snapshot persistence of the domain store
//!
//! The store signals every change through a [`SnapshotNotifier`]; a single
//! [`SnapshotWriter`] task coalesces bursts of changes and rewrites one JSON
//! file per collection. Files are written to `<name>.tmp` and renamed so a
//! crash mid-write never leaves a truncated snapshot behind.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use parley_api::domain::{ChannelRecord, PrivateMessageRecord, PublicationRecord, UserRecord};
use parley_common::ParleyError;

use super::store::DomainStore;
use crate::model::Configuration;

pub const USERS_FILE: &str = "users.json";
pub const CHANNELS_FILE: &str = "channels.json";
pub const PUBLICATIONS_FILE: &str = "publications.json";
pub const MESSAGES_FILE: &str = "messages.json";

/// Full copy of the domain store
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoreSnapshot {
    pub users: Vec<UserRecord>,
    pub channels: Vec<ChannelRecord>,
    pub publications: Vec<PublicationRecord>,
    pub messages: Vec<PrivateMessageRecord>,
}

#[derive(Clone, Debug)]
pub struct PersistenceConfig {
    pub data_dir: PathBuf,
    /// Window during which further changes are folded into the same write
    pub batch_window: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            batch_window: Duration::from_millis(200),
        }
    }
}

impl PersistenceConfig {
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            data_dir: PathBuf::from(config.data_dir()),
            batch_window: Duration::from_millis(config.persistence_batch_ms()),
        }
    }
}

/// Non-blocking "store changed" signal
#[derive(Clone, Debug)]
pub struct SnapshotNotifier {
    tx: mpsc::Sender<()>,
}

impl SnapshotNotifier {
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        // One pending signal is enough: the writer always snapshots the latest state
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

pub struct SnapshotWriter;

impl SnapshotWriter {
    /// Spawn the writer; it runs until every notifier is dropped
    pub fn spawn(
        store: Arc<DomainStore>,
        config: PersistenceConfig,
        mut changes: mpsc::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Snapshot writer started, data dir {}", config.data_dir.display());
            while changes.recv().await.is_some() {
                tokio::time::sleep(config.batch_window).await;
                while changes.try_recv().is_ok() {}

                if let Err(e) = write_snapshot(&config.data_dir, &store.snapshot()).await {
                    error!("Failed to write snapshot: {}", e);
                }
            }
            debug!("Snapshot writer stopped");
        })
    }
}

/// Load the snapshot in `config.data_dir` and keep it up to date
///
/// Returns the restored store and the writer task.
pub async fn open_store(config: PersistenceConfig) -> (Arc<DomainStore>, JoinHandle<()>) {
    let snapshot = load_snapshot(&config.data_dir).await;
    info!(
        "Restored {} users, {} channels, {} publications, {} messages",
        snapshot.users.len(),
        snapshot.channels.len(),
        snapshot.publications.len(),
        snapshot.messages.len()
    );
    let (notifier, changes) = SnapshotNotifier::channel();
    let store = Arc::new(DomainStore::from_snapshot(snapshot).with_notifier(notifier));
    let writer = SnapshotWriter::spawn(store.clone(), config, changes);
    (store, writer)
}

async fn write_json<T: Serialize>(dir: &Path, file: &str, records: &T) -> Result<(), ParleyError> {
    let bytes = serde_json::to_vec_pretty(records).map_err(|e| ParleyError::Storage(e.to_string()))?;
    let target = dir.join(file);
    let tmp = dir.join(format!("{}.tmp", file));

    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| ParleyError::Storage(format!("{}: {}", tmp.display(), e)))?;
    tokio::fs::rename(&tmp, &target)
        .await
        .map_err(|e| ParleyError::Storage(format!("{}: {}", target.display(), e)))
}

/// Write every collection of `snapshot` into `dir`
pub async fn write_snapshot(dir: &Path, snapshot: &StoreSnapshot) -> Result<(), ParleyError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ParleyError::Storage(format!("{}: {}", dir.display(), e)))?;

    write_json(dir, USERS_FILE, &snapshot.users).await?;
    write_json(dir, CHANNELS_FILE, &snapshot.channels).await?;
    write_json(dir, PUBLICATIONS_FILE, &snapshot.publications).await?;
    write_json(dir, MESSAGES_FILE, &snapshot.messages).await?;
    debug!(
        "Snapshot written: {} users, {} channels, {} publications, {} messages",
        snapshot.users.len(),
        snapshot.channels.len(),
        snapshot.publications.len(),
        snapshot.messages.len()
    );
    Ok(())
}

async fn read_json<T: DeserializeOwned>(dir: &Path, file: &str) -> Vec<T> {
    let path = dir.join(file);
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!("Ignoring corrupt snapshot file {}: {}", path.display(), e);
            Vec::new()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            warn!("Cannot read snapshot file {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

/// Load a snapshot; missing or corrupt files yield empty collections
pub async fn load_snapshot(dir: &Path) -> StoreSnapshot {
    StoreSnapshot {
        users: read_json(dir, USERS_FILE).await,
        channels: read_json(dir, CHANNELS_FILE).await,
        publications: read_json(dir, PUBLICATIONS_FILE).await,
        messages: read_json(dir, MESSAGES_FILE).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StoreSnapshot {
        StoreSnapshot {
            users: vec![UserRecord {
                user: "ana".into(),
                timestamp: 1.5,
            }],
            channels: vec![ChannelRecord {
                channel: "geral".into(),
                timestamp: 2.0,
            }],
            publications: vec![PublicationRecord {
                user: "ana".into(),
                channel: "geral".into(),
                message: "oi".into(),
                timestamp: 3.0,
            }],
            messages: vec![],
        }
    }

    #[tokio::test]
    async fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(dir.path(), &sample()).await.unwrap();

        assert_eq!(load_snapshot(dir.path()).await, sample());
        assert!(!dir.path().join("users.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(USERS_FILE), b"{not json").unwrap();

        let snapshot = load_snapshot(dir.path()).await;
        assert_eq!(snapshot, StoreSnapshot::default());
    }

    #[tokio::test]
    async fn test_writer_persists_store_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (notifier, changes) = SnapshotNotifier::channel();
        let store = Arc::new(DomainStore::new().with_notifier(notifier));
        let config = PersistenceConfig {
            data_dir: dir.path().to_path_buf(),
            batch_window: Duration::from_millis(10),
        };
        let writer = SnapshotWriter::spawn(store.clone(), config, changes);

        store
            .add_user(UserRecord {
                user: "ana".into(),
                timestamp: 1.0,
            })
            .unwrap();
        store
            .add_user(UserRecord {
                user: "bia".into(),
                timestamp: 1.0,
            })
            .unwrap();

        let mut persisted = StoreSnapshot::default();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            persisted = load_snapshot(dir.path()).await;
            if persisted.users.len() == 2 {
                break;
            }
        }
        assert_eq!(persisted.users.len(), 2);
        writer.abort();
    }
}
