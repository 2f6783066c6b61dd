//! Session state machine: start, per-record processing, finalize.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use catsync_core::{
    ActiveSession, ChangeType, ProductRecord, RawRecord, RecordError, SessionCounters, SessionId,
    SessionSummary, TransitionError,
};
use catsync_storage::{BackoffPolicy, CatalogStore, RetryDisposition, StoreError};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::changelog::change_record;
use crate::classify::{classify, classify_disappearance, Observation};
use crate::fingerprint::{fingerprint, ContentHash};
use crate::identity::IdentityResolver;

pub const DEFAULT_SESSION_LEASE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub backoff: BackoffPolicy,
    /// How long an unfinished session blocks another session for the same source.
    pub lease: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            lease: DEFAULT_SESSION_LEASE,
        }
    }
}

/// The vendor a session reconciles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSource {
    pub source_id: String,
    pub source_name: String,
}

impl SessionSource {
    pub fn new(source_id: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            source_name: source_name.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("could not open a session for {source_id}: {source}")]
    SessionOpen {
        source_id: String,
        source: StoreError,
    },
    #[error("session {session_id} processed its records but did not finalize cleanly: {source}")]
    Finalize {
        session_id: SessionId,
        source: StoreError,
    },
    #[error("session {0} no longer accepts work")]
    SessionClosed(SessionId),
    #[error("session {session_id} lost the {source_id} lease to a newer session")]
    Superseded {
        session_id: SessionId,
        source_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Invalid(RecordError),
    Store(String),
    Transition(TransitionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Applied(ChangeType),
    Skipped(SkipReason),
}

/// How a whole session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Nothing was processed; the store could not be opened.
    AbortedBeforeStart(ReconcileError),
    Completed(SessionSummary),
    /// Per-record work is committed but the sweep or summary failed.
    /// `finalize` may be retried on the returned reconciler.
    FinalizeFailed {
        reconciler: SessionReconciler,
        error: ReconcileError,
    },
    /// Another session took the source over. Records applied before that
    /// stay applied; no sweep ran and no summary was written.
    Superseded {
        counters: SessionCounters,
        error: ReconcileError,
    },
}

impl SessionOutcome {
    pub fn summary(&self) -> Option<&SessionSummary> {
        match self {
            Self::Completed(summary) => Some(summary),
            _ => None,
        }
    }
}

/// One async lock per catalog entry id. Workers hold it from lookup to write.
#[derive(Debug, Default)]
pub(crate) struct EntryLocks {
    held: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl EntryLocks {
    async fn lock(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let entry_lock = {
            let mut held = self.held.lock().await;
            held.entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        entry_lock.lock_owned().await
    }
}

/// Session state shared by the reconciler and its shard workers.
pub(crate) struct SessionContext {
    pub(crate) store: Arc<dyn CatalogStore>,
    pub(crate) source: SessionSource,
    pub(crate) session_id: SessionId,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) options: SessionOptions,
    entry_locks: EntryLocks,
}

impl SessionContext {
    fn superseded(&self) -> ReconcileError {
        ReconcileError::Superseded {
            session_id: self.session_id.clone(),
            source_id: self.source.source_id.clone(),
        }
    }

    fn observation(&self, now: DateTime<Utc>) -> Observation<'_> {
        Observation {
            source_id: &self.source.source_id,
            session_id: &self.session_id,
            now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Processing,
    Finalizing,
    Finalized,
    Superseded,
}

pub struct SessionReconciler {
    ctx: Arc<SessionContext>,
    counters: SessionCounters,
    phase: Phase,
}

impl fmt::Debug for SessionReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionReconciler")
            .field("session_id", &self.ctx.session_id)
            .field("source_id", &self.ctx.source.source_id)
            .field("counters", &self.counters)
            .field("phase", &self.phase)
            .finish()
    }
}

impl SessionReconciler {
    /// Opens a session: takes the source lease and marks every live entry of
    /// the source as not yet seen.
    pub async fn start(
        store: Arc<dyn CatalogStore>,
        source: SessionSource,
        options: SessionOptions,
    ) -> Result<Self, ReconcileError> {
        let started_at = Utc::now();
        let session_id = SessionId::generate(started_at);
        let active = ActiveSession::new(session_id.clone(), source.source_id.clone(), started_at);

        let marked = store
            .begin_session(&active, options.lease)
            .await
            .map_err(|source_err| {
                error!(source_id = %source.source_id, error = %source_err, "failed to open session");
                ReconcileError::SessionOpen {
                    source_id: source.source_id.clone(),
                    source: source_err,
                }
            })?;

        info!(
            %session_id,
            source_id = %source.source_id,
            marked,
            "starting session"
        );

        Ok(Self {
            ctx: Arc::new(SessionContext {
                store,
                source,
                session_id,
                started_at,
                options,
                entry_locks: EntryLocks::default(),
            }),
            counters: SessionCounters::default(),
            phase: Phase::Processing,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.ctx.session_id
    }

    pub fn source(&self) -> &SessionSource {
        &self.ctx.source
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    pub(crate) fn context(&self) -> Arc<SessionContext> {
        Arc::clone(&self.ctx)
    }

    pub(crate) fn absorb(&mut self, shard: &SessionCounters) {
        self.counters.merge(shard);
    }

    /// Reconciles one scraped record. Bad or unstorable records are skipped,
    /// never surfaced as errors. Losing the source lease stops the session.
    pub async fn process(&mut self, raw: RawRecord) -> Result<RecordOutcome, ReconcileError> {
        match self.phase {
            Phase::Processing => {}
            Phase::Superseded => return Err(self.ctx.superseded()),
            Phase::Finalizing | Phase::Finalized => {
                return Err(ReconcileError::SessionClosed(self.ctx.session_id.clone()))
            }
        }
        let outcome = process_record(&self.ctx, &mut self.counters, raw).await;
        if outcome.is_err() {
            self.phase = Phase::Superseded;
        }
        outcome
    }

    /// Sweeps unseen entries to DELETED, resets the seen flags, persists the
    /// summary and releases the lease. Safe to call again after a failure.
    pub async fn finalize(&mut self) -> Result<SessionSummary, ReconcileError> {
        match self.phase {
            Phase::Finalized => {
                return Err(ReconcileError::SessionClosed(self.ctx.session_id.clone()))
            }
            Phase::Superseded => return Err(self.ctx.superseded()),
            Phase::Processing | Phase::Finalizing => {}
        }
        self.phase = Phase::Finalizing;

        let span = info_span!(
            "finalize_session",
            session_id = %self.ctx.session_id,
            source_id = %self.ctx.source.source_id
        );
        match self.sweep_and_close().instrument(span).await {
            Ok(summary) => {
                self.phase = Phase::Finalized;
                let c = &summary.counters;
                info!(
                    session_id = %summary.session_id,
                    new = c.new,
                    updated = c.updated,
                    unchanged = c.unchanged,
                    deleted = c.deleted,
                    processed = c.processed,
                    skipped = c.skipped,
                    "session completed"
                );
                Ok(summary)
            }
            Err(StoreError::LeaseLost { .. }) => {
                self.phase = Phase::Superseded;
                error!(
                    session_id = %self.ctx.session_id,
                    "lease taken over by a newer session; skipping sweep"
                );
                Err(self.ctx.superseded())
            }
            Err(source) => {
                error!(session_id = %self.ctx.session_id, error = %source, "finalize failed");
                Err(ReconcileError::Finalize {
                    session_id: self.ctx.session_id.clone(),
                    source,
                })
            }
        }
    }

    /// Finalizes and folds the result into a [`SessionOutcome`].
    pub async fn finish(mut self) -> SessionOutcome {
        match self.finalize().await {
            Ok(summary) => SessionOutcome::Completed(summary),
            Err(error @ ReconcileError::Superseded { .. }) => SessionOutcome::Superseded {
                counters: self.counters,
                error,
            },
            Err(error) => SessionOutcome::FinalizeFailed {
                reconciler: self,
                error,
            },
        }
    }

    async fn sweep_and_close(&mut self) -> Result<SessionSummary, StoreError> {
        let ctx = Arc::clone(&self.ctx);
        let store: &dyn CatalogStore = ctx.store.as_ref();
        let policy = ctx.options.backoff;

        let session_id = &ctx.session_id;
        let unseen = store
            .unseen_entries(&ctx.source.source_id, session_id)
            .await?;
        for existing in unseen {
            let obs = ctx.observation(Utc::now());
            let classification = match classify_disappearance(&existing, &obs) {
                Ok(classification) => classification,
                Err(err) => {
                    warn!(identity = %existing.identity, error = %err, "skipping sweep candidate");
                    continue;
                }
            };
            let change = change_record(&classification, &obs);
            let entry = &classification.entry;
            let change_ref = change.as_ref();
            with_retry(&policy, move || store.apply(session_id, entry, change_ref)).await?;

            self.counters.record(ChangeType::Deleted);
            info!(
                identity = %entry.identity,
                title = %entry.title,
                "DELETED"
            );
        }

        let summary = SessionSummary {
            session_id: ctx.session_id.clone(),
            source_id: ctx.source.source_id.clone(),
            source_name: ctx.source.source_name.clone(),
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            counters: self.counters,
        };
        let summary_ref = &summary;
        with_retry(&policy, move || store.end_session(summary_ref)).await?;
        Ok(summary)
    }
}

/// Runs `op` until it succeeds, fails permanently, or retries run out.
async fn with_retry<T, F, Fut>(policy: &BackoffPolicy, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err)
                if err.disposition() == RetryDisposition::Retryable
                    && attempt < policy.max_retries =>
            {
                warn!(attempt, error = %err, "retrying store operation");
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

enum RecordFailure {
    Store(StoreError),
    Transition(TransitionError),
}

impl From<StoreError> for RecordFailure {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<TransitionError> for RecordFailure {
    fn from(err: TransitionError) -> Self {
        Self::Transition(err)
    }
}

/// Validate, fingerprint, resolve, classify and apply one record.
///
/// Transient store failures retry the whole step, since classification
/// depends on the entry's current persisted state. The only error is a lost
/// lease; everything else ends as a skip.
pub(crate) async fn process_record(
    ctx: &SessionContext,
    counters: &mut SessionCounters,
    raw: RawRecord,
) -> Result<RecordOutcome, ReconcileError> {
    let record = match raw.validate() {
        Ok(record) => record,
        Err(err) => {
            warn!(session_id = %ctx.session_id, error = %err, "dropping invalid record");
            counters.skipped += 1;
            return Ok(RecordOutcome::Skipped(SkipReason::Invalid(err)));
        }
    };
    let content_hash = fingerprint(&record.payload);
    let policy = ctx.options.backoff;

    let mut attempt = 0;
    loop {
        match reconcile_one(ctx, &record, &content_hash).await {
            Ok(change_type) => {
                counters.record(change_type);
                counters.processed += 1;
                return Ok(RecordOutcome::Applied(change_type));
            }
            Err(RecordFailure::Store(StoreError::LeaseLost { .. })) => {
                warn!(identity = %record.identity, "lease lost; stopping session");
                return Err(ctx.superseded());
            }
            Err(RecordFailure::Store(err))
                if err.disposition() == RetryDisposition::Retryable
                    && attempt < policy.max_retries =>
            {
                warn!(identity = %record.identity, attempt, error = %err, "retrying record");
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(RecordFailure::Store(err)) => {
                error!(identity = %record.identity, error = %err, "dropping record after store failure");
                counters.skipped += 1;
                return Ok(RecordOutcome::Skipped(SkipReason::Store(err.to_string())));
            }
            Err(RecordFailure::Transition(err)) => {
                error!(identity = %record.identity, error = %err, "dropping record with illegal transition");
                counters.skipped += 1;
                return Ok(RecordOutcome::Skipped(SkipReason::Transition(err)));
            }
        }
    }
}

async fn reconcile_one(
    ctx: &SessionContext,
    record: &ProductRecord,
    content_hash: &ContentHash,
) -> Result<ChangeType, RecordFailure> {
    let source_id = &ctx.source.source_id;
    let resolver = IdentityResolver::new(ctx.store.as_ref());
    let own_id = record.identity.entry_id(source_id);

    // Hold the lock of the entry the lookup lands on, not of the record's own key.
    let mut target = own_id;
    let (existing, _entry_lock) = loop {
        let entry_lock = ctx.entry_locks.lock(target).await;
        let existing = resolver.resolve(source_id, record).await?;
        let resolved = existing.as_ref().map_or(own_id, |entry| entry.id);
        if resolved == target {
            break (existing, entry_lock);
        }
        drop(entry_lock);
        target = resolved;
    };

    let obs = ctx.observation(Utc::now());
    let classification = classify(existing.as_ref(), record, content_hash, &obs)?;
    let change = change_record(&classification, &obs);
    ctx.store
        .apply(&ctx.session_id, &classification.entry, change.as_ref())
        .await?;

    let entry = &classification.entry;
    match classification.change_type {
        ChangeType::New => info!(
            identity = %entry.identity,
            title = %entry.title,
            "NEW"
        ),
        ChangeType::Updated => {
            let fields = classification
                .field_diffs
                .keys()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            info!(
                identity = %entry.identity,
                title = %entry.title,
                changes = %fields,
                resurrected = classification.resurrected,
                "UPDATED"
            );
        }
        ChangeType::Unchanged => debug!(identity = %entry.identity, "UNCHANGED"),
        ChangeType::Deleted => {}
    }
    Ok(classification.change_type)
}

/// Drives a whole session from a record channel.
///
/// Cancellation stops intake; the records already applied are still
/// finalized so the sweep and summary stay consistent with them.
pub async fn run_session(
    store: Arc<dyn CatalogStore>,
    source: SessionSource,
    options: SessionOptions,
    mut records: mpsc::Receiver<RawRecord>,
    cancel: CancellationToken,
) -> SessionOutcome {
    let span = info_span!("reconcile_session", source_id = %source.source_id);
    async move {
        let mut reconciler = match SessionReconciler::start(store, source, options).await {
            Ok(reconciler) => reconciler,
            Err(err) => return SessionOutcome::AbortedBeforeStart(err),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(session_id = %reconciler.session_id(), "session cancelled; finalizing applied records");
                    break;
                }
                next = records.recv() => next,
            };
            let Some(raw) = next else { break };
            if let Err(err) = reconciler.process(raw).await {
                error!(error = %err, "session stopped accepting records");
                break;
            }
        }

        reconciler.finish().await
    }
    .instrument(span)
    .await
}

/// Runs a session over an in-memory batch of records.
pub async fn reconcile_records(
    store: Arc<dyn CatalogStore>,
    source: SessionSource,
    options: SessionOptions,
    records: impl IntoIterator<Item = RawRecord>,
) -> SessionOutcome {
    let mut reconciler = match SessionReconciler::start(store, source, options).await {
        Ok(reconciler) => reconciler,
        Err(err) => return SessionOutcome::AbortedBeforeStart(err),
    };
    for raw in records {
        if let Err(err) = reconciler.process(raw).await {
            error!(error = %err, "session stopped accepting records");
            break;
        }
    }
    reconciler.finish().await
}
