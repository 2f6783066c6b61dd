//! Core catalog model for catsync: scraped records, catalog entries, lifecycle
//! status, change records and session bookkeeping.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "catsync-core";

/// Schema-flexible attribute map carried by records and entries.
pub type Payload = BTreeMap<String, JsonValue>;

/// Field-level diff keyed by attribute name.
pub type FieldDiffs = BTreeMap<String, FieldDiff>;

/// One scraped product record exactly as the scraper produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub Payload);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record has no usable title")]
    MissingTitle,
    #[error("record has no usable url")]
    MissingUrl,
}

impl RawRecord {
    pub fn new(payload: Payload) -> Self {
        Self(payload)
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    pub fn sku(&self) -> Option<String> {
        self.0.get("sku").and_then(key_value)
    }

    pub fn url(&self) -> Option<String> {
        self.0.get("url").and_then(key_value)
    }

    pub fn title(&self) -> Option<String> {
        self.0.get("title").and_then(key_value)
    }

    /// Key used to route the record before validation: SKU when present, else URL.
    pub fn routing_key(&self) -> Option<String> {
        self.sku().or_else(|| self.url())
    }

    /// Checks title/url and strips null or empty-list attributes.
    pub fn validate(self) -> Result<ProductRecord, RecordError> {
        let title = self.title().ok_or(RecordError::MissingTitle)?;
        let url = self.url().ok_or(RecordError::MissingUrl)?;
        let sku = self.sku();

        let mut payload: Payload = self
            .0
            .into_iter()
            .filter(|(_, value)| !is_blank(value))
            .collect();
        if sku.is_none() {
            payload.remove("sku");
        }

        let identity = match &sku {
            Some(sku) => EntryIdentity::Sku(sku.clone()),
            None => EntryIdentity::Url(url.clone()),
        };

        Ok(ProductRecord {
            identity,
            sku,
            url,
            title,
            payload,
        })
    }
}

impl From<Payload> for RawRecord {
    fn from(payload: Payload) -> Self {
        Self(payload)
    }
}

fn key_value(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// A validated record ready for identity resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub identity: EntryIdentity,
    pub sku: Option<String>,
    pub url: String,
    pub title: String,
    pub payload: Payload,
}

/// Stable identity of a catalog entry. Assigned once, never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum EntryIdentity {
    Sku(String),
    Url(String),
}

impl EntryIdentity {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sku(_) => "sku",
            Self::Url(_) => "url",
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Sku(key) | Self::Url(key) => key,
        }
    }

    /// Deterministic entry id for this identity within a source.
    pub fn entry_id(&self, source_id: &str) -> Uuid {
        let name = format!("catsync:{source_id}:{self}");
        Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
    }
}

impl fmt::Display for EntryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.key())
    }
}

/// Lifecycle status of a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusFlag {
    New,
    Updated,
    Unchanged,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal status transition {from} -> {to:?}")]
pub struct TransitionError {
    pub from: StatusLabel,
    pub to: StatusFlag,
}

/// Printable "from" side of a transition, which may be absent for new entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusLabel(pub Option<StatusFlag>);

impl fmt::Display for StatusLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(status) => f.write_str(status.as_str()),
            None => f.write_str("<none>"),
        }
    }
}

impl StatusFlag {
    pub const ALL: [StatusFlag; 4] = [Self::New, Self::Updated, Self::Unchanged, Self::Deleted];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Updated => "UPDATED",
            Self::Unchanged => "UNCHANGED",
            Self::Deleted => "DELETED",
        }
    }

    /// Transition table for entry lifecycle.
    ///
    /// A missing entry may only become `New`. Live entries may move to
    /// `Updated`, `Unchanged` or `Deleted`. A deleted entry can only come back
    /// through `Updated`.
    pub fn transition(from: Option<StatusFlag>, to: StatusFlag) -> Result<StatusFlag, TransitionError> {
        use StatusFlag::*;
        let legal = match (from, to) {
            (None, New) => true,
            (Some(New | Updated | Unchanged), Updated | Unchanged | Deleted) => true,
            (Some(Deleted), Updated) => true,
            _ => false,
        };
        if legal {
            Ok(to)
        } else {
            Err(TransitionError {
                from: StatusLabel(from),
                to,
            })
        }
    }
}

impl fmt::Display for StatusFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown status flag `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for StatusFlag {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEW" => Ok(Self::New),
            "UPDATED" => Ok(Self::Updated),
            "UNCHANGED" => Ok(Self::Unchanged),
            "DELETED" => Ok(Self::Deleted),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// Outcome of classifying one observation (or one sweep hit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    New,
    Updated,
    Unchanged,
    Deleted,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Updated => "UPDATED",
            Self::Unchanged => "UNCHANGED",
            Self::Deleted => "DELETED",
        }
    }

    /// Unchanged observations are routine and never reach the change log.
    pub fn is_logged(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StatusFlag::from_str(s).map(|status| match status {
            StatusFlag::New => Self::New,
            StatusFlag::Updated => Self::Updated,
            StatusFlag::Unchanged => Self::Unchanged,
            StatusFlag::Deleted => Self::Deleted,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub old: Option<JsonValue>,
    pub new: Option<JsonValue>,
}

/// Persisted product row; one per distinct identity per source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: Uuid,
    pub source_id: String,
    pub identity: EntryIdentity,
    pub sku: Option<String>,
    pub url: String,
    pub title: String,
    pub payload: Payload,
    pub content_hash: String,
    pub status_flag: StatusFlag,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub seen_in_session: bool,
    pub last_seen_session_id: Option<SessionId>,
    pub needs_processing: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

impl CatalogEntry {
    pub fn is_deleted(&self) -> bool {
        self.status_flag == StatusFlag::Deleted
    }

    /// Observed earlier in the given session.
    pub fn seen_during(&self, session_id: &SessionId) -> bool {
        self.seen_in_session && self.last_seen_session_id.as_ref() == Some(session_id)
    }

    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.payload.get(name)
    }
}

/// Immutable audit record for a NEW, UPDATED or DELETED transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: Uuid,
    pub session_id: SessionId,
    pub source_id: String,
    pub entry_identity: EntryIdentity,
    pub title: Option<String>,
    pub change_type: ChangeType,
    pub field_diffs: FieldDiffs,
    pub timestamp: DateTime<Utc>,
    pub needs_user_review: bool,
    #[serde(default)]
    pub resurrected: bool,
}

static LAST_ISSUED_MICROS: AtomicI64 = AtomicI64::new(0);

/// Session identifier derived from the session start time.
///
/// Formatted as `YYYYMMDD_HHMMSS_ffffff` so lexical order is chronological.
/// Ids issued by one process are strictly increasing even when two sessions
/// start within the same microsecond.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate(started_at: DateTime<Utc>) -> Self {
        let candidate = started_at.timestamp_micros();
        let mut previous = LAST_ISSUED_MICROS.load(Ordering::Relaxed);
        let issued = loop {
            let next = candidate.max(previous.saturating_add(1));
            match LAST_ISSUED_MICROS.compare_exchange(
                previous,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break next,
                Err(actual) => previous = actual,
            }
        };
        let stamp = DateTime::<Utc>::from_timestamp_micros(issued).unwrap_or(started_at);
        Self(stamp.format("%Y%m%d_%H%M%S_%6f").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Running per-session counters, owned by one reconciler (or one shard).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub new: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub deleted: u64,
    pub processed: u64,
    pub skipped: u64,
}

impl SessionCounters {
    pub fn record(&mut self, change_type: ChangeType) {
        match change_type {
            ChangeType::New => self.new += 1,
            ChangeType::Updated => self.updated += 1,
            ChangeType::Unchanged => self.unchanged += 1,
            ChangeType::Deleted => self.deleted += 1,
        }
    }

    pub fn merge(&mut self, other: &SessionCounters) {
        self.new += other.new;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.deleted += other.deleted;
        self.processed += other.processed;
        self.skipped += other.skipped;
    }
}

/// Lease held by the session currently reconciling a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub session_id: SessionId,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    /// Last write made under the lease. Staleness is measured from here.
    #[serde(default)]
    pub renewed_at: Option<DateTime<Utc>>,
}

impl ActiveSession {
    pub fn new(
        session_id: SessionId,
        source_id: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            source_id: source_id.into(),
            started_at,
            renewed_at: None,
        }
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.renewed_at.map_or(self.started_at, |at| at.max(self.started_at))
    }
}

/// Persisted record of one finished reconciliation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub source_id: String,
    pub source_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counters: SessionCounters,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn raw(value: JsonValue) -> RawRecord {
        serde_json::from_value(value).expect("raw record")
    }

    #[test]
    fn validation_requires_title_and_url() {
        assert_eq!(
            raw(json!({"url": "u1", "title": "  "})).validate(),
            Err(RecordError::MissingTitle)
        );
        assert_eq!(
            raw(json!({"title": "Mixer"})).validate(),
            Err(RecordError::MissingUrl)
        );
    }

    #[test]
    fn identity_prefers_sku_and_falls_back_to_url() {
        let with_sku = raw(json!({"sku": "A1", "url": "u1", "title": "Mixer"}))
            .validate()
            .unwrap();
        assert_eq!(with_sku.identity, EntryIdentity::Sku("A1".into()));

        let blank_sku = raw(json!({"sku": "", "url": "u1", "title": "Mixer"}))
            .validate()
            .unwrap();
        assert_eq!(blank_sku.identity, EntryIdentity::Url("u1".into()));
        assert!(!blank_sku.payload.contains_key("sku"));
    }

    #[test]
    fn validation_strips_null_and_empty_list_attributes() {
        let record = raw(json!({
            "url": "u1",
            "title": "Mixer",
            "colors": [],
            "warranty": null,
            "features": ["Ceramic disc"]
        }))
        .validate()
        .unwrap();
        assert!(!record.payload.contains_key("colors"));
        assert!(!record.payload.contains_key("warranty"));
        assert!(record.payload.contains_key("features"));
    }

    #[test]
    fn transition_table_rejects_illegal_moves() {
        use StatusFlag::*;
        assert_eq!(StatusFlag::transition(None, New), Ok(New));
        assert_eq!(StatusFlag::transition(Some(Deleted), Updated), Ok(Updated));
        assert!(StatusFlag::transition(Some(Deleted), Unchanged).is_err());
        assert!(StatusFlag::transition(Some(Deleted), Deleted).is_err());
        assert!(StatusFlag::transition(Some(Unchanged), New).is_err());
        assert!(StatusFlag::transition(None, Updated).is_err());
        for from in [New, Updated, Unchanged] {
            for to in [Updated, Unchanged, Deleted] {
                assert_eq!(StatusFlag::transition(Some(from), to), Ok(to));
            }
        }
    }

    #[test]
    fn session_ids_are_unique_and_sortable() {
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).single().unwrap();
        let first = SessionId::generate(started);
        let second = SessionId::generate(started);
        assert_ne!(first, second);
        assert!(first < second);
        assert!(first.as_str().starts_with("20260301_083000_"));
    }

    #[test]
    fn entry_ids_are_deterministic_per_source() {
        let identity = EntryIdentity::Sku("A1".into());
        assert_eq!(identity.entry_id("phoenix"), identity.entry_id("phoenix"));
        assert_ne!(identity.entry_id("phoenix"), identity.entry_id("methven"));
    }

    #[test]
    fn status_flags_round_trip_through_strings() {
        for status in StatusFlag::ALL {
            assert_eq!(status.as_str().parse::<StatusFlag>(), Ok(status));
        }
        assert_eq!("deleted".parse::<StatusFlag>(), Ok(StatusFlag::Deleted));
        assert!("PROCESSED".parse::<StatusFlag>().is_err());
    }
}
