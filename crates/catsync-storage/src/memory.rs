use std::time::Duration;

use async_trait::async_trait;
use catsync_core::{
    ActiveSession, CatalogEntry, ChangeRecord, EntryIdentity, SessionId, SessionSummary,
};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::state::CatalogState;
use crate::{
    CatalogReader, CatalogStore, ChangeFilter, EntryQuery, Page, StatusCounts, StoreError,
};

/// Process-local catalog. Used by tests and one-shot dry runs.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: Mutex<CatalogState>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads entries directly, outside any session.
    pub async fn load_entries(&self, entries: impl IntoIterator<Item = CatalogEntry>) {
        let mut state = self.state.lock().await;
        for entry in entries {
            state.insert(&entry, None);
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn begin_session(
        &self,
        session: &ActiveSession,
        lease: Duration,
    ) -> Result<u64, StoreError> {
        self.state.lock().await.begin_session(session, lease)
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
        self.state
            .lock()
            .await
            .apply(session_id, entry, change, Utc::now())
    }

    async fn unseen_entries(
        &self,
        source_id: &str,
        session_id: &SessionId,
    ) -> Result<Vec<CatalogEntry>, StoreError> {
        self.state.lock().await.unseen_entries(source_id, session_id)
    }

    async fn end_session(&self, summary: &SessionSummary) -> Result<(), StoreError> {
        self.state.lock().await.end_session(summary)
    }
}

#[async_trait]
impl CatalogReader for MemoryCatalogStore {
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
        Ok(self
            .state
            .lock()
            .await
            .mark_processed(source_id, identity, at))
    }
}
