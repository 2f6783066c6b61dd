use std::collections::BTreeMap;
use std::time::Duration;

use catsync_core::{
    ActiveSession, CatalogEntry, ChangeRecord, EntryIdentity, SessionId, SessionSummary,
    StatusFlag,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChangeFilter, EntryQuery, Page, StatusCounts, StoreError};

/// Whole catalog held in memory. Shared by the in-memory and JSON-file stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct CatalogState {
    /// Keyed by `source_id/identity`.
    #[serde(default)]
    entries: BTreeMap<String, CatalogEntry>,
    #[serde(default)]
    changes: Vec<ChangeRecord>,
    #[serde(default)]
    sessions: Vec<SessionSummary>,
    #[serde(default)]
    active_sessions: BTreeMap<String, ActiveSession>,
}

fn entry_key(source_id: &str, identity: &EntryIdentity) -> String {
    format!("{source_id}/{identity}")
}

impl CatalogState {
    pub(crate) fn begin_session(
        &mut self,
        session: &ActiveSession,
        lease: Duration,
    ) -> Result<u64, StoreError> {
        if let Some(active) = self.active_sessions.get(&session.source_id) {
            let idle = session
                .started_at
                .signed_duration_since(active.last_heartbeat())
                .to_std()
                .unwrap_or_default();
            if active.session_id != session.session_id && idle < lease {
                return Err(StoreError::SessionConflict {
                    source_id: session.source_id.clone(),
                    session_id: active.session_id.clone(),
                });
            }
        }
        self.active_sessions
            .insert(session.source_id.clone(), session.clone());

        let mut marked = 0;
        for entry in self.entries.values_mut() {
            if entry.source_id == session.source_id && !entry.is_deleted() {
                entry.seen_in_session = false;
                marked += 1;
            }
        }
        Ok(marked)
    }

    /// The lease of `source_id` must still belong to `session_id`.
    fn ensure_holder(&self, source_id: &str, session_id: &SessionId) -> Result<(), StoreError> {
        match self.active_sessions.get(source_id) {
            Some(active) if &active.session_id == session_id => Ok(()),
            _ => Err(StoreError::LeaseLost {
                source_id: source_id.to_string(),
                session_id: session_id.clone(),
            }),
        }
    }

    pub(crate) fn find_by_sku(&self, source_id: &str, sku: &str) -> Option<CatalogEntry> {
        self.entries
            .get(&entry_key(source_id, &EntryIdentity::Sku(sku.to_string())))
            .cloned()
    }

    pub(crate) fn find_by_url(&self, source_id: &str, url: &str) -> Option<CatalogEntry> {
        if let Some(entry) = self
            .entries
            .get(&entry_key(source_id, &EntryIdentity::Url(url.to_string())))
        {
            return Some(entry.clone());
        }
        self.entries
            .values()
            .filter(|entry| entry.source_id == source_id && entry.url == url)
            .min_by_key(|entry| entry.first_seen_at)
            .cloned()
    }

    pub(crate) fn apply(
        &mut self,
        session_id: &SessionId,
        entry: &CatalogEntry,
        change: Option<&ChangeRecord>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_holder(&entry.source_id, session_id)?;
        if let Some(active) = self.active_sessions.get_mut(&entry.source_id) {
            active.renewed_at = Some(at);
        }
        self.insert(entry, change);
        Ok(())
    }

    /// Writes outside any session. Seeds fixtures and imports.
    pub(crate) fn insert(&mut self, entry: &CatalogEntry, change: Option<&ChangeRecord>) {
        self.entries
            .insert(entry_key(&entry.source_id, &entry.identity), entry.clone());
        if let Some(change) = change {
            self.changes.push(change.clone());
        }
    }

    pub(crate) fn unseen_entries(
        &self,
        source_id: &str,
        session_id: &SessionId,
    ) -> Result<Vec<CatalogEntry>, StoreError> {
        self.ensure_holder(source_id, session_id)?;
        Ok(self
            .entries
            .values()
            .filter(|entry| {
                entry.source_id == source_id
                    && !entry.seen_during(session_id)
                    && !entry.is_deleted()
            })
            .cloned()
            .collect())
    }

    pub(crate) fn end_session(&mut self, summary: &SessionSummary) -> Result<(), StoreError> {
        if self
            .sessions
            .iter()
            .any(|existing| existing.session_id == summary.session_id)
        {
            return Ok(());
        }
        self.ensure_holder(&summary.source_id, &summary.session_id)?;
        for entry in self.entries.values_mut() {
            if entry.source_id == summary.source_id {
                entry.seen_in_session = false;
            }
        }
        self.sessions.push(summary.clone());
        self.active_sessions.remove(&summary.source_id);
        Ok(())
    }

    pub(crate) fn get_entry(&self, source_id: &str, identity: &EntryIdentity) -> Option<CatalogEntry> {
        self.entries.get(&entry_key(source_id, identity)).cloned()
    }

    pub(crate) fn list_entries(&self, query: &EntryQuery) -> Page<CatalogEntry> {
        let (page, limit) = query.normalized_paging();
        let mut matching: Vec<&CatalogEntry> =
            self.entries.values().filter(|e| query.matches(e)).collect();
        matching.sort_by(|a, b| {
            b.last_updated_at
                .cmp(&a.last_updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let total = matching.len() as u64;
        let skip = usize::try_from(query.offset()).unwrap_or(usize::MAX);
        let items = matching
            .into_iter()
            .skip(skip)
            .take(limit as usize)
            .cloned()
            .collect();
        Page::new(items, total, page, limit)
    }

    pub(crate) fn status_counts(&self, source_id: &str) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in self.entries.values().filter(|e| e.source_id == source_id) {
            counts.record(entry.status_flag);
        }
        counts
    }

    pub(crate) fn changes(&self, filter: &ChangeFilter) -> Vec<ChangeRecord> {
        self.changes
            .iter()
            .filter(|change| filter.matches(change))
            .cloned()
            .collect()
    }

    pub(crate) fn session_summaries(&self, source_id: Option<&str>) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter(|s| source_id.map_or(true, |id| s.source_id == id))
            .cloned()
            .collect();
        summaries.sort_by(|a, b| b.session_id.cmp(&a.session_id));
        summaries
    }

    pub(crate) fn pending_entries(&self, source_id: &str) -> Vec<CatalogEntry> {
        self.entries
            .values()
            .filter(|entry| {
                entry.source_id == source_id
                    && entry.needs_processing
                    && matches!(entry.status_flag, StatusFlag::New | StatusFlag::Updated)
            })
            .cloned()
            .collect()
    }

    pub(crate) fn mark_processed(
        &mut self,
        source_id: &str,
        identity: &EntryIdentity,
        at: DateTime<Utc>,
    ) -> bool {
        match self.entries.get_mut(&entry_key(source_id, identity)) {
            Some(entry) => {
                entry.needs_processing = false;
                entry.processed_at = Some(at);
                true
            }
            None => false,
        }
    }
}
