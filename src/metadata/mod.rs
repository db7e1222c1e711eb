//! # Metadata Sinks
//!
//! Index/storage sinks receiving each finalized item at chain exit, plus the
//! run summary at the end of a session.

pub mod csv;
pub mod jsonl;
pub mod sqlite;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::item::{EvidenceItem, ItemStatus};
use crate::tasks::{DerivedContent, ItemOutput};

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub case: String,
    pub outcome: String,
    pub enumerated: u64,
    pub done: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub pending: u64,
    pub bytes_processed: u64,
    pub elapsed_seconds: f64,
}

/// What the chain hands to the sink for one item.
#[derive(Debug, Clone, Copy)]
pub struct ItemSubmission<'a> {
    pub run_id: &'a str,
    pub item: &'a EvidenceItem,
    pub status: ItemStatus,
    pub output: &'a ItemOutput,
}

impl<'a> ItemSubmission<'a> {
    pub fn metadata(&self) -> &'a BTreeMap<String, Value> {
        &self.output.metadata
    }

    pub fn derived(&self) -> &'a DerivedContent {
        &self.output.derived
    }

    pub fn content_hash(&self) -> Option<&'a str> {
        self.output.content_hash.as_ref().map(|h| h.as_str())
    }

    pub fn duplicate_of(&self) -> Option<&'a str> {
        self.output.duplicate_of.as_ref().map(|id| id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataBackendKind {
    Jsonl,
    Csv,
    Sqlite,
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] ::csv::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("other error: {0}")]
    Other(String),
}

/// Output sink for finalized items.
///
/// # Example
/// ```rust
/// use caseflow::metadata::{self, MetadataBackendKind, RunSummary};
///
/// let out = std::env::temp_dir().join("caseflow_meta_example");
/// let sink = metadata::build_sink(MetadataBackendKind::Jsonl, "example_run", "abc", &out, false)
///     .unwrap();
/// let summary = RunSummary {
///     run_id: "example_run".to_string(),
///     case: "demo".to_string(),
///     outcome: "completed".to_string(),
///     enumerated: 0,
///     done: 0,
///     failed: 0,
///     duplicates: 0,
///     pending: 0,
///     bytes_processed: 0,
///     elapsed_seconds: 0.0,
/// };
/// sink.record_run_summary(&summary).unwrap();
/// sink.flush().unwrap();
/// ```
pub trait MetadataSink: Send + Sync {
    fn submit(&self, submission: &ItemSubmission<'_>) -> Result<(), MetadataError>;
    fn record_run_summary(&self, summary: &RunSummary) -> Result<(), MetadataError>;
    fn flush(&self) -> Result<(), MetadataError>;
}

/// A no-op sink for dry-run mode that doesn't write any files
pub struct DryRunSink;

impl MetadataSink for DryRunSink {
    fn submit(&self, _submission: &ItemSubmission<'_>) -> Result<(), MetadataError> {
        Ok(())
    }
    fn record_run_summary(&self, _summary: &RunSummary) -> Result<(), MetadataError> {
        Ok(())
    }
    fn flush(&self) -> Result<(), MetadataError> {
        Ok(())
    }
}

/// Builds the sink under `<output_dir>/metadata`.
///
/// With `append` the existing output of an interrupted run is extended
/// instead of replaced.
pub fn build_sink(
    backend: MetadataBackendKind,
    tool_version: &str,
    config_hash: &str,
    output_dir: &Path,
    append: bool,
) -> Result<Arc<dyn MetadataSink>, MetadataError> {
    let meta_dir = output_dir.join("metadata");
    std::fs::create_dir_all(&meta_dir)?;
    match backend {
        MetadataBackendKind::Jsonl => Ok(Arc::new(jsonl::JsonlSink::new(
            tool_version,
            config_hash,
            &meta_dir,
            append,
        )?)),
        MetadataBackendKind::Csv => Ok(Arc::new(csv::CsvSink::new(
            tool_version,
            config_hash,
            &meta_dir,
            append,
        )?)),
        MetadataBackendKind::Sqlite => Ok(Arc::new(sqlite::SqliteSink::new(
            tool_version,
            config_hash,
            &meta_dir,
            append,
        )?)),
    }
}

/// Build a dry-run sink that doesn't write any files
pub fn build_dry_run_sink() -> Arc<dyn MetadataSink> {
    Arc::new(DryRunSink)
}

/// Opens `path` for writing, appending when resuming. Returns whether the
/// file already had content (so headers are not written twice).
pub(crate) fn open_output(path: &Path, append: bool) -> std::io::Result<(std::fs::File, bool)> {
    let had_content = append && std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)?;
    Ok((file, had_content))
}
