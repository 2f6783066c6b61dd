use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use catsync_core::{
    ActiveSession, CatalogEntry, ChangeRecord, ChangeType, EntryIdentity, RawRecord, SessionId,
    SessionSummary, StatusFlag,
};
use catsync_reconcile::{
    reconcile_records, run_session, ReconcileError, RecordOutcome, SessionOptions,
    SessionOutcome, SessionReconciler, SessionSource, SkipReason,
};
use catsync_storage::{
    BackoffPolicy, CatalogReader, CatalogStore, ChangeFilter, MemoryCatalogStore, StoreError,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn raw(value: serde_json::Value) -> RawRecord {
    serde_json::from_value(value).expect("raw record")
}

fn phoenix() -> SessionSource {
    SessionSource::new("phoenix", "Phoenix Tapware")
}

fn fast_options() -> SessionOptions {
    SessionOptions {
        backoff: BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        },
        ..SessionOptions::default()
    }
}

fn sku(key: &str) -> EntryIdentity {
    EntryIdentity::Sku(key.to_string())
}

async fn completed(
    store: &Arc<MemoryCatalogStore>,
    source: SessionSource,
    records: Vec<RawRecord>,
) -> SessionSummary {
    match reconcile_records(store.clone(), source, fast_options(), records).await {
        SessionOutcome::Completed(summary) => summary,
        other => panic!("session did not complete: {other:?}"),
    }
}

async fn changes_of(store: &MemoryCatalogStore, summary: &SessionSummary) -> Vec<ChangeRecord> {
    store
        .changes(&ChangeFilter {
            session_id: Some(summary.session_id.clone()),
            ..ChangeFilter::default()
        })
        .await
        .expect("changes")
}

fn mixer() -> RawRecord {
    raw(json!({"sku": "A1", "title": "Vivid Mixer", "url": "https://phoenix.example/a1", "status": "In stock"}))
}

fn tap() -> RawRecord {
    raw(json!({"sku": "B2", "title": "Lexi Tap", "url": "https://phoenix.example/b2", "status": "In stock"}))
}

#[tokio::test]
async fn new_product_then_unchanged_rescrape() {
    let store = Arc::new(MemoryCatalogStore::new());

    let first = completed(&store, phoenix(), vec![mixer()]).await;
    assert_eq!(first.counters.new, 1);
    let entry = store.get_entry("phoenix", &sku("A1")).await.unwrap().expect("entry");
    assert_eq!(entry.status_flag, StatusFlag::New);
    assert!(entry.needs_processing);

    let changes = changes_of(&store, &first).await;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].change_type, ChangeType::New);
    assert!(changes[0].needs_user_review);

    let second = completed(&store, phoenix(), vec![mixer()]).await;
    assert_eq!(second.counters.unchanged, 1);
    assert_eq!(second.counters.new, 0);
    assert!(changes_of(&store, &second).await.is_empty());

    let entry = store.get_entry("phoenix", &sku("A1")).await.unwrap().expect("entry");
    assert_eq!(entry.status_flag, StatusFlag::Unchanged);
    assert!(!entry.needs_processing);
    assert_eq!(store.status_counts("phoenix").await.unwrap().all, 1);
}

#[tokio::test]
async fn omitted_product_is_deleted_once() {
    let store = Arc::new(MemoryCatalogStore::new());
    completed(&store, phoenix(), vec![mixer(), tap()]).await;

    let second = completed(&store, phoenix(), vec![mixer()]).await;
    assert_eq!(second.counters.deleted, 1);
    let deletions = changes_of(&store, &second).await;
    assert_eq!(deletions.len(), 1);
    assert_eq!(deletions[0].change_type, ChangeType::Deleted);
    assert_eq!(deletions[0].entry_identity, sku("B2"));
    assert!(deletions[0].needs_user_review);

    let gone = store.get_entry("phoenix", &sku("B2")).await.unwrap().expect("entry");
    assert_eq!(gone.status_flag, StatusFlag::Deleted);
    assert!(gone.deleted_at.is_some());

    let third = completed(&store, phoenix(), vec![mixer()]).await;
    assert_eq!(third.counters.deleted, 0);
    assert!(changes_of(&store, &third).await.is_empty());
}

#[tokio::test]
async fn status_change_is_updated_and_flagged_for_review() {
    let store = Arc::new(MemoryCatalogStore::new());
    completed(&store, phoenix(), vec![tap()]).await;

    let out_of_stock = raw(json!({"sku": "B2", "title": "Lexi Tap", "url": "https://phoenix.example/b2", "status": "Out of stock"}));
    let summary = completed(&store, phoenix(), vec![out_of_stock]).await;
    assert_eq!(summary.counters.updated, 1);

    let changes = changes_of(&store, &summary).await;
    assert_eq!(changes.len(), 1);
    let change = &changes[0];
    assert_eq!(change.change_type, ChangeType::Updated);
    assert!(change.needs_user_review);
    let diff = change.field_diffs.get("status").expect("status diff");
    assert_eq!(diff.old, Some(json!("In stock")));
    assert_eq!(diff.new, Some(json!("Out of stock")));
    assert_eq!(change.field_diffs.len(), 1);
}

#[tokio::test]
async fn minor_field_update_does_not_need_review() {
    let store = Arc::new(MemoryCatalogStore::new());
    completed(&store, phoenix(), vec![mixer()]).await;

    let reworded = raw(json!({"sku": "A1", "title": "Vivid Mixer", "url": "https://phoenix.example/a1", "status": "In stock", "description": "Now with ceramic cartridge"}));
    let summary = completed(&store, phoenix(), vec![reworded]).await;
    let changes = changes_of(&store, &summary).await;
    assert_eq!(changes.len(), 1);
    assert!(!changes[0].needs_user_review);
    assert!(changes[0].field_diffs.contains_key("description"));
}

#[tokio::test]
async fn deleted_product_coming_back_is_resurrected() {
    let store = Arc::new(MemoryCatalogStore::new());
    completed(&store, phoenix(), vec![mixer(), tap()]).await;
    let first_seen = store
        .get_entry("phoenix", &sku("B2"))
        .await
        .unwrap()
        .expect("entry")
        .first_seen_at;
    completed(&store, phoenix(), vec![mixer()]).await;

    let back = completed(&store, phoenix(), vec![mixer(), tap()]).await;
    assert_eq!(back.counters.updated, 1);
    assert_eq!(back.counters.unchanged, 1);

    let changes = changes_of(&store, &back).await;
    assert_eq!(changes.len(), 1);
    assert!(changes[0].resurrected);
    assert_eq!(changes[0].change_type, ChangeType::Updated);

    let entry = store.get_entry("phoenix", &sku("B2")).await.unwrap().expect("entry");
    assert_eq!(entry.status_flag, StatusFlag::Updated);
    assert_eq!(entry.deleted_at, None);
    assert_eq!(entry.first_seen_at, first_seen);
    assert!(entry.needs_processing);
}

#[tokio::test]
async fn rerunning_the_same_feed_logs_nothing_new() {
    let store = Arc::new(MemoryCatalogStore::new());
    let feed = vec![mixer(), tap()];
    completed(&store, phoenix(), feed.clone()).await;
    let rerun = completed(&store, phoenix(), feed).await;

    assert_eq!(rerun.counters.unchanged, 2);
    assert_eq!(rerun.counters.processed, 2);
    assert!(changes_of(&store, &rerun).await.is_empty());
    assert_eq!(store.session_summaries(Some("phoenix")).await.unwrap().len(), 2);
}

#[tokio::test]
async fn duplicate_in_one_session_counts_once_as_new() {
    let store = Arc::new(MemoryCatalogStore::new());
    let summary = completed(&store, phoenix(), vec![mixer(), mixer()]).await;
    assert_eq!(summary.counters.new, 1);
    assert_eq!(summary.counters.unchanged, 1);
    assert_eq!(summary.counters.processed, 2);

    let entry = store.get_entry("phoenix", &sku("A1")).await.unwrap().expect("entry");
    assert_eq!(entry.status_flag, StatusFlag::New);
    assert!(entry.needs_processing);
    assert_eq!(changes_of(&store, &summary).await.len(), 1);
}

#[tokio::test]
async fn invalid_records_are_skipped_without_failing_the_session() {
    let store = Arc::new(MemoryCatalogStore::new());
    let mut reconciler = SessionReconciler::start(store.clone(), phoenix(), fast_options())
        .await
        .expect("start");

    let outcome = reconciler
        .process(raw(json!({"sku": "Z9", "url": "https://phoenix.example/z9"})))
        .await
        .expect("open session");
    assert!(matches!(outcome, RecordOutcome::Skipped(SkipReason::Invalid(_))));
    let outcome = reconciler.process(mixer()).await.expect("open session");
    assert_eq!(outcome, RecordOutcome::Applied(ChangeType::New));

    let summary = reconciler.finalize().await.expect("finalize");
    assert_eq!(summary.counters.skipped, 1);
    assert_eq!(summary.counters.processed, 1);
    assert!(matches!(
        reconciler.process(tap()).await,
        Err(ReconcileError::SessionClosed(_))
    ));
}

#[tokio::test]
async fn sessions_only_sweep_their_own_source() {
    let store = Arc::new(MemoryCatalogStore::new());
    let methven = SessionSource::new("methven", "Methven");
    completed(&store, methven.clone(), vec![tap()]).await;
    completed(&store, phoenix(), vec![mixer()]).await;
    completed(&store, phoenix(), vec![]).await;

    let methven_entry = store.get_entry("methven", &sku("B2")).await.unwrap().expect("entry");
    assert_eq!(methven_entry.status_flag, StatusFlag::New);
    let phoenix_entry = store.get_entry("phoenix", &sku("A1")).await.unwrap().expect("entry");
    assert_eq!(phoenix_entry.status_flag, StatusFlag::Deleted);
}

#[tokio::test]
async fn concurrent_session_for_the_same_source_is_refused() {
    let store = Arc::new(MemoryCatalogStore::new());
    let _running = SessionReconciler::start(store.clone(), phoenix(), fast_options())
        .await
        .expect("first session");

    match reconcile_records(store.clone(), phoenix(), fast_options(), vec![mixer()]).await {
        SessionOutcome::AbortedBeforeStart(ReconcileError::SessionOpen { source, .. }) => {
            assert!(matches!(source, StoreError::SessionConflict { .. }));
        }
        other => panic!("expected abort, got {other:?}"),
    }
    assert!(store.get_entry("phoenix", &sku("A1")).await.unwrap().is_none());
}

#[tokio::test]
async fn cancelled_session_still_finalizes_applied_records() {
    let store = Arc::new(MemoryCatalogStore::new());
    let first = completed(&store, phoenix(), vec![mixer(), tap()]).await;

    let (tx, rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let session = tokio::spawn(run_session(
        store.clone(),
        phoenix(),
        fast_options(),
        rx,
        cancel.clone(),
    ));
    tx.send(mixer()).await.expect("send");

    for _ in 0..200 {
        let entry = store.get_entry("phoenix", &sku("A1")).await.unwrap().expect("entry");
        if entry.last_seen_session_id.as_ref() != Some(&first.session_id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();

    let summary = match session.await.expect("join") {
        SessionOutcome::Completed(summary) => summary,
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(summary.counters.unchanged, 1);
    assert_eq!(summary.counters.deleted, 1);
    drop(tx);
}

fn takeover_options() -> SessionOptions {
    SessionOptions {
        lease: Duration::ZERO,
        ..fast_options()
    }
}

#[tokio::test]
async fn superseded_session_cannot_sweep_what_the_new_session_saw() {
    let store = Arc::new(MemoryCatalogStore::new());
    completed(&store, phoenix(), vec![mixer(), tap()]).await;

    let mut stalled = SessionReconciler::start(store.clone(), phoenix(), fast_options())
        .await
        .expect("first session");
    stalled.process(mixer()).await.expect("open session");
    stalled.process(tap()).await.expect("open session");

    let mut fresh = SessionReconciler::start(store.clone(), phoenix(), takeover_options())
        .await
        .expect("stale lease is taken over");
    fresh.process(mixer()).await.expect("open session");
    fresh.process(tap()).await.expect("open session");

    let err = stalled.finalize().await.unwrap_err();
    assert!(matches!(err, ReconcileError::Superseded { .. }));
    assert!(matches!(
        stalled.process(mixer()).await,
        Err(ReconcileError::Superseded { .. })
    ));

    let summary = fresh.finalize().await.expect("finalize");
    assert_eq!(summary.counters.deleted, 0);
    assert_eq!(summary.counters.unchanged, 2);
    for key in ["A1", "B2"] {
        let entry = store.get_entry("phoenix", &sku(key)).await.unwrap().expect("entry");
        assert_ne!(entry.status_flag, StatusFlag::Deleted);
    }
    assert!(changes_of(&store, &summary).await.is_empty());

    let summaries = store.session_summaries(Some("phoenix")).await.unwrap();
    assert_eq!(summaries.len(), 2);
    assert!(summaries.iter().all(|s| &s.session_id != stalled.session_id()));
}

#[tokio::test]
async fn old_session_stops_writing_once_taken_over() {
    let store = Arc::new(MemoryCatalogStore::new());
    completed(&store, phoenix(), vec![mixer()]).await;

    let mut stalled = SessionReconciler::start(store.clone(), phoenix(), fast_options())
        .await
        .expect("first session");
    let mut fresh = SessionReconciler::start(store.clone(), phoenix(), takeover_options())
        .await
        .expect("stale lease is taken over");

    assert!(matches!(
        stalled.process(tap()).await,
        Err(ReconcileError::Superseded { .. })
    ));
    assert!(store.get_entry("phoenix", &sku("B2")).await.unwrap().is_none());

    match stalled.finish().await {
        SessionOutcome::Superseded { counters, error } => {
            assert_eq!(counters.processed, 0);
            assert!(matches!(error, ReconcileError::Superseded { .. }));
        }
        other => panic!("expected a superseded session, got {other:?}"),
    }

    fresh.process(mixer()).await.expect("open session");
    let summary = fresh.finalize().await.expect("finalize");
    assert_eq!(summary.counters.unchanged, 1);
    assert_eq!(summary.counters.deleted, 0);
}

/// Wraps the memory store and injects failures into selected calls.
struct FlakyStore {
    inner: MemoryCatalogStore,
    transient_applies: AtomicUsize,
    failing_end_sessions: AtomicUsize,
    failing_begins: AtomicUsize,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryCatalogStore::new(),
            transient_applies: AtomicUsize::new(0),
            failing_end_sessions: AtomicUsize::new(0),
            failing_begins: AtomicUsize::new(0),
        }
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CatalogStore for FlakyStore {
    async fn begin_session(
        &self,
        session: &ActiveSession,
        lease: Duration,
    ) -> Result<u64, StoreError> {
        if Self::take(&self.failing_begins) {
            return Err(StoreError::Connection("connection refused".into()));
        }
        self.inner.begin_session(session, lease).await
    }

    async fn find_by_sku(
        &self,
        source_id: &str,
        sku: &str,
    ) -> Result<Option<CatalogEntry>, StoreError> {
        self.inner.find_by_sku(source_id, sku).await
    }

    async fn find_by_url(
        &self,
        source_id: &str,
        url: &str,
    ) -> Result<Option<CatalogEntry>, StoreError> {
        self.inner.find_by_url(source_id, url).await
    }

    async fn apply(
        &self,
        session_id: &SessionId,
        entry: &CatalogEntry,
        change: Option<&ChangeRecord>,
    ) -> Result<(), StoreError> {
        if Self::take(&self.transient_applies) {
            return Err(StoreError::Transient("write conflict".into()));
        }
        self.inner.apply(session_id, entry, change).await
    }

    async fn unseen_entries(
        &self,
        source_id: &str,
        session_id: &SessionId,
    ) -> Result<Vec<CatalogEntry>, StoreError> {
        self.inner.unseen_entries(source_id, session_id).await
    }

    async fn end_session(&self, summary: &SessionSummary) -> Result<(), StoreError> {
        if Self::take(&self.failing_end_sessions) {
            return Err(StoreError::Database("disk full".into()));
        }
        self.inner.end_session(summary).await
    }
}

#[tokio::test]
async fn transient_store_errors_are_retried() {
    let store = Arc::new(FlakyStore::new());
    store.transient_applies.store(2, Ordering::SeqCst);

    let outcome = reconcile_records(store.clone(), phoenix(), fast_options(), vec![mixer()]).await;
    let summary = outcome.summary().expect("completed");
    assert_eq!(summary.counters.new, 1);
    assert_eq!(summary.counters.skipped, 0);
    assert!(store.inner.get_entry("phoenix", &sku("A1")).await.unwrap().is_some());
}

#[tokio::test]
async fn exhausted_retries_skip_the_record() {
    let store = Arc::new(FlakyStore::new());
    store.transient_applies.store(4, Ordering::SeqCst);

    let outcome = reconcile_records(store.clone(), phoenix(), fast_options(), vec![mixer(), tap()]).await;
    let summary = outcome.summary().expect("completed");
    assert_eq!(summary.counters.skipped, 1);
    assert_eq!(summary.counters.new, 1);
    assert!(store.inner.get_entry("phoenix", &sku("A1")).await.unwrap().is_none());
    assert!(store.inner.get_entry("phoenix", &sku("B2")).await.unwrap().is_some());
}

#[tokio::test]
async fn failed_connection_aborts_before_any_record() {
    let store = Arc::new(FlakyStore::new());
    store.failing_begins.store(1, Ordering::SeqCst);

    let outcome = reconcile_records(store.clone(), phoenix(), fast_options(), vec![mixer()]).await;
    assert!(matches!(
        outcome,
        SessionOutcome::AbortedBeforeStart(ReconcileError::SessionOpen { .. })
    ));
    assert!(store.inner.get_entry("phoenix", &sku("A1")).await.unwrap().is_none());
}

#[tokio::test]
async fn finalize_failure_keeps_applied_records_and_can_be_retried() {
    let store = Arc::new(FlakyStore::new());
    completed_flaky(&store, vec![mixer(), tap()]).await;
    store.failing_end_sessions.store(1, Ordering::SeqCst);

    let outcome = reconcile_records(store.clone(), phoenix(), fast_options(), vec![mixer()]).await;
    let (mut reconciler, error) = match outcome {
        SessionOutcome::FinalizeFailed { reconciler, error } => (reconciler, error),
        other => panic!("expected finalize failure, got {other:?}"),
    };
    assert!(matches!(error, ReconcileError::Finalize { .. }));

    let mixer_entry = store.inner.get_entry("phoenix", &sku("A1")).await.unwrap().expect("entry");
    assert_eq!(mixer_entry.status_flag, StatusFlag::Unchanged);

    let summary = reconciler.finalize().await.expect("retry finalize");
    assert_eq!(summary.counters.deleted, 1);
    assert_eq!(summary.counters.unchanged, 1);

    let summaries = store.inner.session_summaries(Some("phoenix")).await.unwrap();
    assert_eq!(summaries.len(), 2);
    let deletions = store
        .inner
        .changes(&ChangeFilter {
            session_id: Some(summary.session_id.clone()),
            ..ChangeFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(deletions.len(), 1);
}

async fn completed_flaky(store: &Arc<FlakyStore>, records: Vec<RawRecord>) -> SessionSummary {
    match reconcile_records(store.clone(), phoenix(), fast_options(), records).await {
        SessionOutcome::Completed(summary) => summary,
        other => panic!("session did not complete: {other:?}"),
    }
}
