//! Runs sessions for registered sources: feed in, reports out.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use catsync_core::{RawRecord, SessionSummary};
use catsync_feed::{load_record_feed, SourceConfig, SourceRegistry};
use catsync_storage::{CatalogReader, CatalogStore, ChangeFilter};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{CatalogBackend, ReconcileConfig};
use crate::report::{load_source_entries, write_session_report};
use crate::session::{run_session, SessionOutcome, SessionSource};
use crate::shard::run_sharded_session;

const FEED_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct SourceRun {
    pub summary: SessionSummary,
    pub rejected_lines: usize,
    pub report_dir: String,
    pub manifest: String,
}

pub struct ReconcilePipeline {
    config: ReconcileConfig,
    store: Arc<dyn CatalogStore>,
    reader: Arc<dyn CatalogReader>,
}

impl ReconcilePipeline {
    pub fn new(config: ReconcileConfig, backend: &CatalogBackend) -> Self {
        Self {
            config,
            store: backend.store(),
            reader: backend.reader(),
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn load_registry(&self) -> Result<SourceRegistry> {
        let path = self.config.sources_path();
        SourceRegistry::load(&path).with_context(|| format!("loading {}", path.display()))
    }

    /// Reconciles every enabled source in registry order. Cancellation stops
    /// before the next source starts; the running one still finalizes.
    pub async fn run_once(&self, cancel: CancellationToken) -> Result<Vec<SourceRun>> {
        let registry = self.load_registry()?;
        let mut runs = Vec::new();
        for source in registry.enabled() {
            if cancel.is_cancelled() {
                warn!(source_id = %source.source_id, "cancelled before source started");
                break;
            }
            let feed_path = source.resolved_feed_path(&self.config.workspace_root)?;
            runs.push(self.run_source(source, feed_path, cancel.clone()).await?);
        }
        Ok(runs)
    }

    /// Reconciles one source from a record feed file and writes its report.
    pub async fn run_source(
        &self,
        source: &SourceConfig,
        feed_path: PathBuf,
        cancel: CancellationToken,
    ) -> Result<SourceRun> {
        let feed = load_record_feed(&feed_path)?;
        info!(
            source_id = %source.source_id,
            feed = %feed_path.display(),
            records = feed.records.len(),
            rejected_lines = feed.rejected_lines.len(),
            "loaded record feed"
        );

        let session_source = SessionSource::new(&source.source_id, &source.display_name);
        let outcome = self
            .run_records(session_source, feed.records, cancel)
            .await;
        let summary = match outcome {
            SessionOutcome::Completed(summary) => summary,
            SessionOutcome::AbortedBeforeStart(err) => return Err(err.into()),
            SessionOutcome::Superseded { counters, error } => {
                warn!(
                    processed = counters.processed,
                    skipped = counters.skipped,
                    "session superseded before finalize"
                );
                return Err(error.into());
            }
            SessionOutcome::FinalizeFailed { mut reconciler, error } => {
                warn!(error = %error, "retrying session finalize once");
                reconciler
                    .finalize()
                    .await
                    .map_err(|retry| anyhow!(retry).context(error.to_string()))?
            }
        };

        let changes = self
            .reader
            .changes(&ChangeFilter {
                session_id: Some(summary.session_id.clone()),
                ..ChangeFilter::default()
            })
            .await?;
        let entries = load_source_entries(self.reader.as_ref(), &summary.source_id).await?;
        let report =
            write_session_report(&self.config.reports_dir, &summary, &changes, &entries).await?;

        Ok(SourceRun {
            summary,
            rejected_lines: feed.rejected_lines.len(),
            report_dir: report.dir.display().to_string(),
            manifest: report.manifest_path.display().to_string(),
        })
    }

    async fn run_records(
        &self,
        source: SessionSource,
        records: Vec<RawRecord>,
        cancel: CancellationToken,
    ) -> SessionOutcome {
        let (tx, rx) = mpsc::channel(FEED_QUEUE_DEPTH);
        let feeder_cancel = cancel.clone();
        let feeder = tokio::spawn(async move {
            for record in records {
                tokio::select! {
                    biased;
                    _ = feeder_cancel.cancelled() => break,
                    sent = tx.send(record) => if sent.is_err() { break },
                }
            }
        });

        let options = self.config.session_options();
        let store = Arc::clone(&self.store);
        let outcome = if self.config.shards > 1 {
            run_sharded_session(store, source, options, self.config.shards, rx, cancel).await
        } else {
            run_session(store, source, options, rx, cancel).await
        };
        if let Err(err) = feeder.await {
            warn!(error = %err, "feed task ended abnormally");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catsync_core::StatusFlag;
    use catsync_storage::MemoryCatalogStore;

    fn write(path: &std::path::Path, text: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, text).expect("write");
    }

    #[tokio::test]
    async fn run_once_reconciles_enabled_sources_and_writes_reports() {
        let root = tempfile::tempdir().expect("tempdir");
        write(
            &root.path().join("sources.yaml"),
            "sources:\n  - source_id: phoenix\n    display_name: Phoenix Tapware\n    feed_path: feeds/phoenix.jsonl\n  - source_id: idle\n    display_name: Idle Vendor\n    enabled: false\n",
        );
        write(
            &root.path().join("feeds/phoenix.jsonl"),
            "{\"sku\":\"A1\",\"title\":\"Vivid Mixer\",\"url\":\"u1\"}\nnot json\n{\"sku\":\"B2\",\"title\":\"Lexi Tap\",\"url\":\"u2\"}\n",
        );

        let config = ReconcileConfig {
            shards: 2,
            ..ReconcileConfig::from_lookup(|key| match key {
                "CATSYNC_WORKSPACE_ROOT" => Some(root.path().display().to_string()),
                _ => None,
            })
        };
        let backend = CatalogBackend::Memory(Arc::new(MemoryCatalogStore::new()));
        let pipeline = ReconcilePipeline::new(config, &backend);

        let runs = pipeline.run_once(CancellationToken::new()).await.expect("run");
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.summary.source_id, "phoenix");
        assert_eq!(run.summary.source_name, "Phoenix Tapware");
        assert_eq!(run.summary.counters.new, 2);
        assert_eq!(run.rejected_lines, 1);
        assert!(std::path::Path::new(&run.manifest).exists());

        let counts = backend.reader().status_counts("phoenix").await.expect("counts");
        assert_eq!(counts.new, 2);
        let entry = backend
            .reader()
            .get_entry("phoenix", &catsync_core::EntryIdentity::Sku("A1".into()))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(entry.status_flag, StatusFlag::New);
    }
}
