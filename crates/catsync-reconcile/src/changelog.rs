//! Change records and the human-review policy.

use catsync_core::{ChangeRecord, ChangeType, FieldDiffs};
use uuid::Uuid;

use crate::classify::{Classification, Observation};

/// Fields whose change on an UPDATED entry always needs a reviewer.
pub const MAJOR_FIELDS: [&str; 3] = ["title", "status", "wels_rating"];

pub fn needs_user_review(change_type: ChangeType, diffs: &FieldDiffs) -> bool {
    match change_type {
        ChangeType::New | ChangeType::Deleted => true,
        ChangeType::Updated => MAJOR_FIELDS.iter().any(|field| diffs.contains_key(*field)),
        ChangeType::Unchanged => false,
    }
}

/// Builds the audit record for a classification; `None` for UNCHANGED.
pub fn change_record(classification: &Classification, obs: &Observation<'_>) -> Option<ChangeRecord> {
    let change_type = classification.change_type;
    if !change_type.is_logged() {
        return None;
    }
    let entry = &classification.entry;
    Some(ChangeRecord {
        id: Uuid::new_v4(),
        session_id: obs.session_id.clone(),
        source_id: entry.source_id.clone(),
        entry_identity: entry.identity.clone(),
        title: Some(entry.title.clone()),
        change_type,
        field_diffs: classification.field_diffs.clone(),
        timestamp: obs.now,
        needs_user_review: needs_user_review(change_type, &classification.field_diffs),
        resurrected: classification.resurrected,
    })
}
