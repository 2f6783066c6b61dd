//! Parallel record processing inside one session.
//!
//! Records are routed by identity key, so every observation of the same SKU
//! (or URL) lands on the same worker and is applied in arrival order. A
//! URL-only record can still resolve to an entry owned by another worker;
//! the per-entry lock taken in `process_record` serializes those two.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use catsync_core::{RawRecord, SessionCounters};
use catsync_storage::CatalogStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::session::{
    process_record, SessionContext, SessionOptions, SessionOutcome, SessionReconciler,
    SessionSource,
};

const SHARD_QUEUE_DEPTH: usize = 64;

/// Picks the worker for a record. Records without any identity key go to
/// shard 0, where validation rejects them.
pub fn shard_for(record: &RawRecord, shards: usize) -> usize {
    let shards = shards.max(1);
    match record.routing_key() {
        Some(key) => {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() % shards as u64) as usize
        }
        None => 0,
    }
}

fn spawn_worker(
    index: usize,
    ctx: Arc<SessionContext>,
    mut inbox: mpsc::Receiver<RawRecord>,
    halt: CancellationToken,
) -> JoinHandle<SessionCounters> {
    let span = info_span!("shard", index);
    tokio::spawn(
        async move {
            let mut counters = SessionCounters::default();
            while let Some(raw) = inbox.recv().await {
                if let Err(err) = process_record(&ctx, &mut counters, raw).await {
                    warn!(error = %err, "halting session");
                    halt.cancel();
                    break;
                }
            }
            counters
        }
        .instrument(span),
    )
}

/// Like [`crate::run_session`], but fans records out to `shards` workers.
/// The deletion sweep runs once, after every worker has drained.
pub async fn run_sharded_session(
    store: Arc<dyn CatalogStore>,
    source: SessionSource,
    options: SessionOptions,
    shards: usize,
    mut records: mpsc::Receiver<RawRecord>,
    cancel: CancellationToken,
) -> SessionOutcome {
    let shards = shards.max(1);
    let span = info_span!("reconcile_session", source_id = %source.source_id, shards);
    async move {
        let mut reconciler = match SessionReconciler::start(store, source, options).await {
            Ok(reconciler) => reconciler,
            Err(err) => return SessionOutcome::AbortedBeforeStart(err),
        };

        let halt = cancel.child_token();
        let mut senders = Vec::with_capacity(shards);
        let mut workers = Vec::with_capacity(shards);
        for index in 0..shards {
            let (tx, rx) = mpsc::channel(SHARD_QUEUE_DEPTH);
            senders.push(tx);
            workers.push(spawn_worker(index, reconciler.context(), rx, halt.clone()));
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = halt.cancelled() => {
                    info!(session_id = %reconciler.session_id(), "session halted; draining shards");
                    break;
                }
                next = records.recv() => next,
            };
            let Some(raw) = next else { break };
            let index = shard_for(&raw, shards);
            if senders[index].send(raw).await.is_err() {
                warn!(shard = index, "shard worker stopped; record dropped");
            }
        }
        drop(senders);

        for (index, worker) in workers.into_iter().enumerate() {
            match worker.await {
                Ok(counters) => reconciler.absorb(&counters),
                Err(err) => error!(shard = index, error = %err, "shard worker failed"),
            }
        }

        reconciler.finish().await
    }
    .instrument(span)
    .await
}
