//! Per-session report artifacts: markdown brief, JSON change log, parquet
//! snapshots and a checksummed manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use catsync_core::{CatalogEntry, ChangeRecord, ChangeType, SessionSummary};
use catsync_storage::{CatalogReader, EntryQuery, StoreError, MAX_PAGE_LIMIT};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub session_id: String,
    pub source_id: String,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub dir: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: ReportManifest,
}

/// Writes `<reports_root>/<source_id>/<session_id>/` for a finished session.
pub async fn write_session_report(
    reports_root: &Path,
    summary: &SessionSummary,
    changes: &[ChangeRecord],
    entries: &[CatalogEntry],
) -> Result<SessionReport> {
    let dir = reports_root
        .join(&summary.source_id)
        .join(summary.session_id.as_str());
    let snapshot_dir = dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let brief_path = dir.join("session_brief.md");
    fs::write(&brief_path, render_session_brief(summary, changes))
        .await
        .context("writing session_brief.md")?;

    let changes_path = dir.join("changes.json");
    let delta_json = serde_json::to_vec_pretty(&serde_json::json!({
        "session": summary,
        "changes": changes,
    }))
    .context("serializing session changes")?;
    fs::write(&changes_path, delta_json)
        .await
        .context("writing changes.json")?;

    let changes_parquet = snapshot_dir.join("changes.parquet");
    let catalog_parquet = snapshot_dir.join("catalog.parquet");
    write_changes_parquet(&changes_parquet, changes)?;
    write_catalog_parquet(&catalog_parquet, entries)?;

    let manifest = ReportManifest {
        schema_version: 1,
        session_id: summary.session_id.to_string(),
        source_id: summary.source_id.clone(),
        files: vec![
            manifest_entry("session_brief", &dir, &brief_path)?,
            manifest_entry("changes_json", &dir, &changes_path)?,
            manifest_entry("changes", &dir, &changes_parquet)?,
            manifest_entry("catalog", &dir, &catalog_parquet)?,
        ],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(SessionReport {
        dir,
        manifest_path,
        manifest,
    })
}

pub fn render_session_brief(summary: &SessionSummary, changes: &[ChangeRecord]) -> String {
    let c = &summary.counters;
    let mut lines = vec![
        format!("# Catalog Session `{}`", summary.session_id),
        String::new(),
        format!("- Source: {} (`{}`)", summary.source_name, summary.source_id),
        format!("- Started: {}", summary.started_at.to_rfc3339()),
        format!("- Finished: {}", summary.finished_at.to_rfc3339()),
        format!("- New: {}", c.new),
        format!("- Updated: {}", c.updated),
        format!("- Unchanged: {}", c.unchanged),
        format!("- Deleted: {}", c.deleted),
        format!("- Processed: {}", c.processed),
        format!("- Skipped: {}", c.skipped),
        String::new(),
    ];

    let review = changes
        .iter()
        .filter(|change| change.needs_user_review)
        .collect::<Vec<_>>();
    lines.push(format!("## Needs Review ({})", review.len()));
    if review.is_empty() {
        lines.push("- none".to_string());
    }
    for change in review {
        let title = change.title.as_deref().unwrap_or("untitled");
        let mut line = format!("- {} {} `{}`", change.change_type, title, change.entry_identity);
        if change.change_type == ChangeType::Updated && !change.field_diffs.is_empty() {
            let fields = change
                .field_diffs
                .keys()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            line.push_str(&format!(" ({fields})"));
        }
        if change.resurrected {
            line.push_str(" [resurrected]");
        }
        lines.push(line);
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown table of past sessions, in the order given.
pub fn render_history_markdown(summaries: &[SessionSummary]) -> String {
    let mut lines = vec![
        "# Session History".to_string(),
        String::new(),
        "| session | source | new | updated | unchanged | deleted | processed | skipped |"
            .to_string(),
        "|---|---|---|---|---|---|---|---|".to_string(),
    ];
    for summary in summaries {
        let c = &summary.counters;
        lines.push(format!(
            "| `{}` | {} | {} | {} | {} | {} | {} | {} |",
            summary.session_id,
            summary.source_id,
            c.new,
            c.updated,
            c.unchanged,
            c.deleted,
            c.processed,
            c.skipped
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Every entry of a source, following the reader's pagination.
pub async fn load_source_entries(
    reader: &dyn CatalogReader,
    source_id: &str,
) -> Result<Vec<CatalogEntry>, StoreError> {
    let mut query = EntryQuery {
        page: 1,
        limit: MAX_PAGE_LIMIT,
        ..EntryQuery::for_source(source_id)
    };
    let mut entries = Vec::new();
    loop {
        let page = reader.list_entries(&query).await?;
        let has_next = page.has_next;
        entries.extend(page.items);
        if !has_next {
            return Ok(entries);
        }
        query.page += 1;
    }
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn utf8<'a>(values: impl Iterator<Item = Option<&'a str>>) -> StringArray {
    StringArray::from(values.collect::<Vec<_>>())
}

fn write_changes_parquet(path: &Path, changes: &[ChangeRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("session_id", DataType::Utf8, false),
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("identity_kind", DataType::Utf8, false),
        ArrowField::new("identity_key", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("change_type", DataType::Utf8, false),
        ArrowField::new("changed_fields", DataType::Utf8, false),
        ArrowField::new("needs_user_review", DataType::Boolean, false),
        ArrowField::new("resurrected", DataType::Boolean, false),
        ArrowField::new("timestamp", DataType::Utf8, false),
    ]));

    let changed_fields = changes
        .iter()
        .map(|c| c.field_diffs.keys().cloned().collect::<Vec<_>>().join(","))
        .collect::<Vec<_>>();
    let timestamps = changes
        .iter()
        .map(|c| c.timestamp.to_rfc3339())
        .collect::<Vec<_>>();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(utf8(changes.iter().map(|c| Some(c.session_id.as_str())))),
            Arc::new(utf8(changes.iter().map(|c| Some(c.source_id.as_str())))),
            Arc::new(utf8(changes.iter().map(|c| Some(c.entry_identity.kind())))),
            Arc::new(utf8(changes.iter().map(|c| Some(c.entry_identity.key())))),
            Arc::new(utf8(changes.iter().map(|c| c.title.as_deref()))),
            Arc::new(utf8(changes.iter().map(|c| Some(c.change_type.as_str())))),
            Arc::new(utf8(changed_fields.iter().map(|f| Some(f.as_str())))),
            Arc::new(BooleanArray::from(
                changes.iter().map(|c| c.needs_user_review).collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(
                changes.iter().map(|c| c.resurrected).collect::<Vec<_>>(),
            )),
            Arc::new(utf8(timestamps.iter().map(|t| Some(t.as_str())))),
        ],
    )
    .context("building changes record batch")?;
    write_parquet(path, batch)
}

fn write_catalog_parquet(path: &Path, entries: &[CatalogEntry]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("identity_kind", DataType::Utf8, false),
        ArrowField::new("identity_key", DataType::Utf8, false),
        ArrowField::new("sku", DataType::Utf8, true),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("status_flag", DataType::Utf8, false),
        ArrowField::new("content_hash", DataType::Utf8, false),
        ArrowField::new("needs_processing", DataType::Boolean, false),
        ArrowField::new("first_seen_at", DataType::Utf8, false),
        ArrowField::new("last_updated_at", DataType::Utf8, false),
        ArrowField::new("deleted_at", DataType::Utf8, true),
    ]));

    let first_seen = entries
        .iter()
        .map(|e| e.first_seen_at.to_rfc3339())
        .collect::<Vec<_>>();
    let last_updated = entries
        .iter()
        .map(|e| e.last_updated_at.to_rfc3339())
        .collect::<Vec<_>>();
    let deleted = entries
        .iter()
        .map(|e| e.deleted_at.map(|at| at.to_rfc3339()))
        .collect::<Vec<_>>();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(utf8(entries.iter().map(|e| Some(e.source_id.as_str())))),
            Arc::new(utf8(entries.iter().map(|e| Some(e.identity.kind())))),
            Arc::new(utf8(entries.iter().map(|e| Some(e.identity.key())))),
            Arc::new(utf8(entries.iter().map(|e| e.sku.as_deref()))),
            Arc::new(utf8(entries.iter().map(|e| Some(e.url.as_str())))),
            Arc::new(utf8(entries.iter().map(|e| Some(e.title.as_str())))),
            Arc::new(utf8(entries.iter().map(|e| Some(e.status_flag.as_str())))),
            Arc::new(utf8(entries.iter().map(|e| Some(e.content_hash.as_str())))),
            Arc::new(BooleanArray::from(
                entries.iter().map(|e| e.needs_processing).collect::<Vec<_>>(),
            )),
            Arc::new(utf8(first_seen.iter().map(|t| Some(t.as_str())))),
            Arc::new(utf8(last_updated.iter().map(|t| Some(t.as_str())))),
            Arc::new(utf8(deleted.iter().map(|t| t.as_deref()))),
        ],
    )
    .context("building catalog record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, report_dir: &Path, path: &Path) -> Result<ReportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path
        .strip_prefix(report_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}
