use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use catsync_core::{
    ActiveSession, CatalogEntry, ChangeRecord, EntryIdentity, SessionId, SessionSummary,
};
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::state::CatalogState;
use crate::{
    CatalogReader, CatalogStore, ChangeFilter, EntryQuery, Page, StatusCounts, StoreError,
};

/// Catalog persisted as a single JSON document.
///
/// Every mutation is applied to a copy of the state, written to a temp file
/// and renamed over the previous snapshot, so the file on disk always holds a
/// complete state and a crash never leaves half a record applied.
#[derive(Debug)]
pub struct JsonFileCatalogStore {
    path: PathBuf,
    state: Mutex<CatalogState>,
}

impl JsonFileCatalogStore {
    /// Opens (or creates) the snapshot at `path`. A corrupt or unreadable
    /// snapshot is a connection failure.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
                StoreError::Connection(format!("parsing catalog {}: {err}", path.display()))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => CatalogState::default(),
            Err(err) => {
                return Err(StoreError::Connection(format!(
                    "reading catalog {}: {err}",
                    path.display()
                )))
            }
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|err| {
                StoreError::Connection(format!("creating {}: {err}", parent.display()))
            })?;
        }
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut CatalogState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let out = op(&mut next)?;
        persist_atomically(&self.path, &next).await?;
        *guard = next;
        Ok(out)
    }
}

async fn persist_atomically(path: &Path, state: &CatalogState) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(state)?;
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Transient(format!(
            "renaming {} -> {}: {err}",
            temp_path.display(),
            path.display()
        )));
    }
    debug!(path = %path.display(), bytes = bytes.len(), "catalog snapshot written");
    Ok(())
}

#[async_trait]
impl CatalogStore for JsonFileCatalogStore {
    async fn begin_session(
        &self,
        session: &ActiveSession,
        lease: Duration,
    ) -> Result<u64, StoreError> {
        self.mutate(|state| state.begin_session(session, lease)).await
    }

    async fn find_by_sku(
        &self,
        source_id: &str,
        sku: &str,
    ) -> Result<Option<CatalogEntry>, StoreError> {
        Ok(self.state.lock().await.find_by_sku(source_id, sku))
    }

    async fn find_by_url(
        &self,
        source_id: &str,
        url: &str,
    ) -> Result<Option<CatalogEntry>, StoreError> {
        Ok(self.state.lock().await.find_by_url(source_id, url))
    }

    async fn apply(
        &self,
        session_id: &SessionId,
        entry: &CatalogEntry,
        change: Option<&ChangeRecord>,
    ) -> Result<(), StoreError> {
        let at = Utc::now();
        self.mutate(|state| state.apply(session_id, entry, change, at))
            .await
    }

    async fn unseen_entries(
        &self,
        source_id: &str,
        session_id: &SessionId,
    ) -> Result<Vec<CatalogEntry>, StoreError> {
        self.state.lock().await.unseen_entries(source_id, session_id)
    }

    async fn end_session(&self, summary: &SessionSummary) -> Result<(), StoreError> {
        self.mutate(|state| state.end_session(summary)).await
    }
}

#[async_trait]
impl CatalogReader for JsonFileCatalogStore {
    async fn get_entry(
        &self,
        source_id: &str,
        identity: &EntryIdentity,
    ) -> Result<Option<CatalogEntry>, StoreError> {
        Ok(self.state.lock().await.get_entry(source_id, identity))
    }

    async fn list_entries(&self, query: &EntryQuery) -> Result<Page<CatalogEntry>, StoreError> {
        Ok(self.state.lock().await.list_entries(query))
    }

    async fn status_counts(&self, source_id: &str) -> Result<StatusCounts, StoreError> {
        Ok(self.state.lock().await.status_counts(source_id))
    }

    async fn changes(&self, filter: &ChangeFilter) -> Result<Vec<ChangeRecord>, StoreError> {
        Ok(self.state.lock().await.changes(filter))
    }

    async fn session_summaries(
        &self,
        source_id: Option<&str>,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        Ok(self.state.lock().await.session_summaries(source_id))
    }

    async fn pending_entries(&self, source_id: &str) -> Result<Vec<CatalogEntry>, StoreError> {
        Ok(self.state.lock().await.pending_entries(source_id))
    }

    async fn mark_processed(
        &self,
        source_id: &str,
        identity: &EntryIdentity,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.mutate(|state| Ok(state.mark_processed(source_id, identity, at)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::entry;
    use catsync_core::StatusFlag;
    use tempfile::tempdir;

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("catalog.json");

        let store = JsonFileCatalogStore::open(&path).await.expect("open");
        let active = ActiveSession::new(SessionId::from("s1"), "phoenix", Utc::now());
        store
            .begin_session(&active, Duration::from_secs(600))
            .await
            .expect("lease");
        let mut e = entry("phoenix", "A1", "u1", "Mixer");
        e.status_flag = StatusFlag::Updated;
        store.apply(&active.session_id, &e, None).await.expect("apply");
        drop(store);

        let reopened = JsonFileCatalogStore::open(&path).await.expect("reopen");
        let found = reopened
            .find_by_sku("phoenix", "A1")
            .await
            .expect("lookup")
            .expect("entry persisted");
        assert_eq!(found, e);

        let late = ActiveSession::new(SessionId::from("s2"), "phoenix", Utc::now());
        assert!(matches!(
            reopened.begin_session(&late, Duration::from_secs(600)).await,
            Err(StoreError::SessionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_a_connection_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, b"{not json").expect("write");

        let err = JsonFileCatalogStore::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
    }

    #[tokio::test]
    async fn rejected_mutation_leaves_snapshot_untouched() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");
        let store = JsonFileCatalogStore::open(&path).await.expect("open");
        let lease = Duration::from_secs(600);

        let first = ActiveSession::new(SessionId::from("s1"), "phoenix", Utc::now());
        store.begin_session(&first, lease).await.expect("first lease");
        let before = std::fs::read(&path).expect("snapshot");

        let second = ActiveSession {
            session_id: SessionId::from("s2"),
            ..first.clone()
        };
        assert!(store.begin_session(&second, lease).await.is_err());
        let stray = entry("phoenix", "A1", "u1", "Mixer");
        assert!(matches!(
            store.apply(&second.session_id, &stray, None).await,
            Err(StoreError::LeaseLost { .. })
        ));
        assert_eq!(std::fs::read(&path).expect("snapshot"), before);
    }
}
