//! Catalog reconciliation: turns a vendor's scraped records into a persisted
//! catalog with lifecycle flags, an audit log of changes and a per-session
//! summary.
//!
//! One [`SessionReconciler`] owns one session of one source. Records flow
//! through [`fingerprint`], [`IdentityResolver`] and [`classify`], and each
//! outcome is applied to the store together with its [`ChangeRecord`] entry.
//!
//! [`ChangeRecord`]: catsync_core::ChangeRecord

pub mod changelog;
pub mod classify;
pub mod config;
pub mod fingerprint;
pub mod identity;
pub mod pipeline;
pub mod report;
pub mod session;
pub mod shard;

pub use changelog::{change_record, needs_user_review, MAJOR_FIELDS};
pub use classify::{
    classify, classify_disappearance, detect_changes, Classification, Observation, TRACKED_FIELDS,
};
pub use config::{CatalogBackend, ReconcileConfig, StoreKind};
pub use fingerprint::{canonical_content, fingerprint, ContentHash, CONTENT_FIELDS};
pub use identity::IdentityResolver;
pub use pipeline::{ReconcilePipeline, SourceRun};
pub use report::{
    load_source_entries, render_history_markdown, render_session_brief, write_session_report,
    SessionReport,
};
pub use session::{
    reconcile_records, run_session, ReconcileError, RecordOutcome, SessionOptions,
    SessionOutcome, SessionReconciler, SessionSource, SkipReason, DEFAULT_SESSION_LEASE,
};
pub use shard::{run_sharded_session, shard_for};

pub const CRATE_NAME: &str = "catsync-reconcile";
