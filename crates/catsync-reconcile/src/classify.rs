//! Lifecycle classification of a single observation.

use catsync_core::{
    CatalogEntry, ChangeType, FieldDiff, FieldDiffs, Payload, ProductRecord, SessionId,
    StatusFlag, TransitionError,
};
use chrono::{DateTime, Utc};

use crate::fingerprint::{ContentHash, CONTENT_FIELDS};

/// Fields compared when building an UPDATED diff: the content fields plus images.
pub const TRACKED_FIELDS: [&str; 12] = [
    CONTENT_FIELDS[0],
    CONTENT_FIELDS[1],
    CONTENT_FIELDS[2],
    CONTENT_FIELDS[3],
    CONTENT_FIELDS[4],
    CONTENT_FIELDS[5],
    CONTENT_FIELDS[6],
    CONTENT_FIELDS[7],
    CONTENT_FIELDS[8],
    CONTENT_FIELDS[9],
    CONTENT_FIELDS[10],
    "images",
];

/// Where and when an observation happens.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub source_id: &'a str,
    pub session_id: &'a SessionId,
    pub now: DateTime<Utc>,
}

/// Result of classification: the entry as it must be stored afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub change_type: ChangeType,
    pub entry: CatalogEntry,
    pub field_diffs: FieldDiffs,
    pub resurrected: bool,
}

/// Compares old and new values of every tracked field.
pub fn detect_changes(old: &Payload, new: &Payload) -> FieldDiffs {
    let mut diffs = FieldDiffs::new();
    for field in TRACKED_FIELDS {
        let old_value = old.get(field);
        let new_value = new.get(field);
        if old_value != new_value {
            diffs.insert(
                field.to_string(),
                FieldDiff {
                    old: old_value.cloned(),
                    new: new_value.cloned(),
                },
            );
        }
    }
    diffs
}

/// Decides NEW / UPDATED / UNCHANGED for an incoming record.
///
/// A deleted entry that shows up again is always UPDATED and keeps its
/// `first_seen_at`. A repeat observation inside the same session with
/// identical content is UNCHANGED but keeps the status and
/// `needs_processing` assigned by the first observation.
pub fn classify(
    existing: Option<&CatalogEntry>,
    incoming: &ProductRecord,
    content_hash: &ContentHash,
    obs: &Observation<'_>,
) -> Result<Classification, TransitionError> {
    let Some(existing) = existing else {
        let status_flag = StatusFlag::transition(None, StatusFlag::New)?;
        let entry = CatalogEntry {
            id: incoming.identity.entry_id(obs.source_id),
            source_id: obs.source_id.to_string(),
            identity: incoming.identity.clone(),
            sku: incoming.sku.clone(),
            url: incoming.url.clone(),
            title: incoming.title.clone(),
            payload: incoming.payload.clone(),
            content_hash: content_hash.as_str().to_string(),
            status_flag,
            first_seen_at: obs.now,
            last_updated_at: obs.now,
            last_seen_at: obs.now,
            seen_in_session: true,
            last_seen_session_id: Some(obs.session_id.clone()),
            needs_processing: true,
            deleted_at: None,
            processed_at: None,
        };
        return Ok(Classification {
            change_type: ChangeType::New,
            entry,
            field_diffs: FieldDiffs::new(),
            resurrected: false,
        });
    };

    let resurrected = existing.is_deleted();
    if resurrected || !content_hash.matches(&existing.content_hash) {
        let status_flag = StatusFlag::transition(Some(existing.status_flag), StatusFlag::Updated)?;
        let field_diffs = detect_changes(&existing.payload, &incoming.payload);
        let entry = CatalogEntry {
            sku: incoming.sku.clone().or_else(|| existing.sku.clone()),
            url: incoming.url.clone(),
            title: incoming.title.clone(),
            payload: incoming.payload.clone(),
            content_hash: content_hash.as_str().to_string(),
            status_flag,
            last_updated_at: obs.now,
            last_seen_at: obs.now,
            seen_in_session: true,
            last_seen_session_id: Some(obs.session_id.clone()),
            needs_processing: true,
            deleted_at: None,
            ..existing.clone()
        };
        return Ok(Classification {
            change_type: ChangeType::Updated,
            entry,
            field_diffs,
            resurrected,
        });
    }

    let mut entry = existing.clone();
    if !existing.seen_during(obs.session_id) {
        entry.status_flag = StatusFlag::transition(Some(existing.status_flag), StatusFlag::Unchanged)?;
        entry.needs_processing = false;
    }
    entry.last_seen_at = obs.now;
    entry.seen_in_session = true;
    entry.last_seen_session_id = Some(obs.session_id.clone());
    Ok(Classification {
        change_type: ChangeType::Unchanged,
        entry,
        field_diffs: FieldDiffs::new(),
        resurrected: false,
    })
}

/// Marks an entry that was not observed during the session as deleted.
pub fn classify_disappearance(
    existing: &CatalogEntry,
    obs: &Observation<'_>,
) -> Result<Classification, TransitionError> {
    let status_flag = StatusFlag::transition(Some(existing.status_flag), StatusFlag::Deleted)?;
    let entry = CatalogEntry {
        status_flag,
        deleted_at: Some(obs.now),
        ..existing.clone()
    };
    Ok(Classification {
        change_type: ChangeType::Deleted,
        entry,
        field_diffs: FieldDiffs::new(),
        resurrected: false,
    })
}
