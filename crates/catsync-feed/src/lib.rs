//! Scraped record feeds and the vendor source registry.

use std::fs;
use std::path::{Path, PathBuf};

use catsync_core::RawRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "catsync-feed";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Document {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("parsing source registry {path}: {source}")]
    Registry {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("unknown source `{0}`")]
    UnknownSource(String),
    #[error("source `{0}` has no feed_path configured")]
    MissingFeed(String),
}

/// Records parsed from one scraper output file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFeed {
    pub records: Vec<RawRecord>,
    /// 1-based line numbers of JSONL lines that were not JSON objects.
    pub rejected_lines: Vec<usize>,
}

/// Parses a feed that is either a JSON array of objects or JSON Lines.
///
/// A broken JSONL line is skipped and reported in `rejected_lines`; a broken
/// JSON array fails as a whole.
pub fn parse_record_feed(text: &str) -> Result<RecordFeed, serde_json::Error> {
    if text.trim_start().starts_with('[') {
        let records: Vec<RawRecord> = serde_json::from_str(text)?;
        return Ok(RecordFeed {
            records,
            rejected_lines: Vec::new(),
        });
    }

    let mut feed = RecordFeed::default();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RawRecord>(line) {
            Ok(record) => feed.records.push(record),
            Err(err) => {
                warn!(line = idx + 1, error = %err, "skipping malformed feed line");
                feed.rejected_lines.push(idx + 1);
            }
        }
    }
    Ok(feed)
}

pub fn load_record_feed(path: impl AsRef<Path>) -> Result<RecordFeed, FeedError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| FeedError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_record_feed(&text).map_err(|source| FeedError::Document {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub source_id: String,
    /// Manufacturer / vendor name shown in summaries.
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub feed_path: Option<PathBuf>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, FeedError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| FeedError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text).map_err(|source| FeedError::Registry {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn find(&self, source_id: &str) -> Result<&SourceConfig, FeedError> {
        self.sources
            .iter()
            .find(|s| s.source_id == source_id)
            .ok_or_else(|| FeedError::UnknownSource(source_id.to_string()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

impl SourceConfig {
    /// Feed path resolved against the workspace root.
    pub fn resolved_feed_path(&self, workspace_root: &Path) -> Result<PathBuf, FeedError> {
        let feed = self
            .feed_path
            .as_ref()
            .ok_or_else(|| FeedError::MissingFeed(self.source_id.clone()))?;
        Ok(if feed.is_absolute() {
            feed.clone()
        } else {
            workspace_root.join(feed)
        })
    }
}
