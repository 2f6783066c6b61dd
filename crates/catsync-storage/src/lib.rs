//! Catalog persistence for catsync: store contracts, backends and retry policy.

use std::time::Duration;

use async_trait::async_trait;
use catsync_core::{
    ActiveSession, CatalogEntry, ChangeRecord, ChangeType, EntryIdentity, SessionId,
    SessionSummary, StatusFlag,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod file;
mod memory;
mod postgres;
mod state;

pub use file::JsonFileCatalogStore;
pub use memory::MemoryCatalogStore;
pub use postgres::PgCatalogStore;

pub const CRATE_NAME: &str = "catsync-storage";

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("source {source_id} already has an active session {session_id}")]
    SessionConflict {
        source_id: String,
        session_id: SessionId,
    },
    #[error("session {session_id} no longer holds the lease for {source_id}")]
    LeaseLost {
        source_id: String,
        session_id: SessionId,
    },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Transient(_) | Self::Conflict(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Write side used by the reconciliation pipeline.
///
/// Every method is scoped to one source so concurrent sessions for
/// different vendors never see each other's entries.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Takes the per-source session lease and clears `seen_in_session` on every
    /// live entry of the source. Returns the number of entries marked.
    ///
    /// Fails with [`StoreError::SessionConflict`] while another session for the
    /// same source started or wrote within the last `lease`.
    async fn begin_session(&self, session: &ActiveSession, lease: Duration)
        -> Result<u64, StoreError>;

    async fn find_by_sku(&self, source_id: &str, sku: &str)
        -> Result<Option<CatalogEntry>, StoreError>;

    /// Looks up by source URL. An entry whose identity is this URL wins over
    /// SKU-identified entries that merely share the URL.
    async fn find_by_url(&self, source_id: &str, url: &str)
        -> Result<Option<CatalogEntry>, StoreError>;

    /// Upserts the entry (keyed by its id) and appends the change record in one
    /// atomic step, then renews the lease of `session_id`.
    ///
    /// Fails with [`StoreError::LeaseLost`] and writes nothing once `session_id`
    /// no longer holds the lease of the entry's source.
    async fn apply(
        &self,
        session_id: &SessionId,
        entry: &CatalogEntry,
        change: Option<&ChangeRecord>,
    ) -> Result<(), StoreError>;

    /// Live entries of the source not observed by `session_id`. Fails with
    /// [`StoreError::LeaseLost`] when the session no longer holds the lease.
    async fn unseen_entries(&self, source_id: &str, session_id: &SessionId)
        -> Result<Vec<CatalogEntry>, StoreError>;

    /// Resets `seen_in_session` for the source, persists the summary and
    /// releases the lease. Repeating it for an already recorded summary is a
    /// no-op; a session that lost its lease gets [`StoreError::LeaseLost`].
    async fn end_session(&self, summary: &SessionSummary) -> Result<(), StoreError>;
}

/// Query surface for downstream readers (storefront sync, audit and history views).
#[async_trait]
pub trait CatalogReader: Send + Sync {
    async fn get_entry(&self, source_id: &str, identity: &EntryIdentity)
        -> Result<Option<CatalogEntry>, StoreError>;

    async fn list_entries(&self, query: &EntryQuery) -> Result<Page<CatalogEntry>, StoreError>;

    async fn status_counts(&self, source_id: &str) -> Result<StatusCounts, StoreError>;

    async fn changes(&self, filter: &ChangeFilter) -> Result<Vec<ChangeRecord>, StoreError>;

    /// Newest first.
    async fn session_summaries(&self, source_id: Option<&str>)
        -> Result<Vec<SessionSummary>, StoreError>;

    /// Entries the storefront sync still has to pick up.
    async fn pending_entries(&self, source_id: &str) -> Result<Vec<CatalogEntry>, StoreError>;

    /// Clears `needs_processing` after downstream sync. Returns false when the
    /// entry does not exist.
    async fn mark_processed(
        &self,
        source_id: &str,
        identity: &EntryIdentity,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn change_counts(&self, session_id: &SessionId) -> Result<ChangeCounts, StoreError> {
        let changes = self
            .changes(&ChangeFilter {
                session_id: Some(session_id.clone()),
                ..ChangeFilter::default()
            })
            .await?;
        let mut counts = ChangeCounts::default();
        for change in &changes {
            counts.record(change.change_type);
        }
        Ok(counts)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryQuery {
    pub source_id: Option<String>,
    pub status: Option<StatusFlag>,
    /// Case-insensitive match against title or SKU.
    pub search: Option<String>,
    pub page: u32,
    pub limit: u32,
}

impl EntryQuery {
    pub fn for_source(source_id: impl Into<String>) -> Self {
        Self {
            source_id: Some(source_id.into()),
            ..Self::default()
        }
    }

    /// Page starts at 1; limits outside 1..=100 fall back to the default.
    pub fn normalized_paging(&self) -> (u32, u32) {
        let page = self.page.max(1);
        let limit = if (1..=MAX_PAGE_LIMIT).contains(&self.limit) {
            self.limit
        } else {
            DEFAULT_PAGE_LIMIT
        };
        (page, limit)
    }

    /// Rows skipped before the requested page.
    pub fn offset(&self) -> u64 {
        let (page, limit) = self.normalized_paging();
        u64::from(page - 1).saturating_mul(u64::from(limit))
    }

    pub fn search_needle(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }

    pub fn matches(&self, entry: &CatalogEntry) -> bool {
        if let Some(source_id) = &self.source_id {
            if &entry.source_id != source_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if entry.status_flag != status {
                return false;
            }
        }
        if let Some(needle) = self.search_needle() {
            let in_title = entry.title.to_lowercase().contains(&needle);
            let in_sku = entry
                .sku
                .as_deref()
                .map(|sku| sku.to_lowercase().contains(&needle))
                .unwrap_or(false);
            if !in_title && !in_sku {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u32,
    pub has_next: bool,
    pub has_prev: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, page: u32, limit: u32) -> Self {
        let total_pages = (total.div_ceil(u64::from(limit)).max(1)) as u32;
        Self {
            items,
            total,
            page,
            limit,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub new: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub deleted: u64,
    pub all: u64,
}

impl StatusCounts {
    pub fn record(&mut self, status: StatusFlag) {
        match status {
            StatusFlag::New => self.new += 1,
            StatusFlag::Updated => self.updated += 1,
            StatusFlag::Unchanged => self.unchanged += 1,
            StatusFlag::Deleted => self.deleted += 1,
        }
        self.all += 1;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub new: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl ChangeCounts {
    pub fn record(&mut self, change_type: ChangeType) {
        match change_type {
            ChangeType::New => self.new += 1,
            ChangeType::Updated => self.updated += 1,
            ChangeType::Deleted => self.deleted += 1,
            ChangeType::Unchanged => {}
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeFilter {
    pub session_id: Option<SessionId>,
    pub source_id: Option<String>,
    pub review_only: bool,
}

impl ChangeFilter {
    pub fn matches(&self, change: &ChangeRecord) -> bool {
        self.session_id
            .as_ref()
            .map_or(true, |id| &change.session_id == id)
            && self
                .source_id
                .as_ref()
                .map_or(true, |id| &change.source_id == id)
            && (!self.review_only || change.needs_user_review)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert_eq!(
            StoreError::Transient("write conflict".into()).disposition(),
            RetryDisposition::Retryable
        );
        assert_eq!(
            StoreError::Connection("refused".into()).disposition(),
            RetryDisposition::NonRetryable
        );
        let lost = StoreError::LeaseLost {
            source_id: "phoenix".into(),
            session_id: SessionId::from("s1"),
        };
        assert_eq!(lost.disposition(), RetryDisposition::NonRetryable);
    }

    #[test]
    fn paging_is_clamped() {
        let query = EntryQuery {
            page: 0,
            limit: 500,
            ..EntryQuery::default()
        };
        assert_eq!(query.normalized_paging(), (1, DEFAULT_PAGE_LIMIT));

        let page: Page<u8> = Page::new(vec![], 41, 2, 20);
        assert_eq!(page.total_pages, 3);
        assert!(page.has_next);
        assert!(page.has_prev);

        let far = EntryQuery {
            page: u32::MAX,
            limit: MAX_PAGE_LIMIT,
            ..EntryQuery::default()
        };
        assert_eq!(far.offset(), u64::from(u32::MAX - 1) * 100);
        assert_eq!(EntryQuery::default().offset(), 0);

        let empty: Page<u8> = Page::new(vec![], 0, 1, 20);
        assert_eq!(empty.total_pages, 1);
        assert!(!empty.has_next);
    }
}
