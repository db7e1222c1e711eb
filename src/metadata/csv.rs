use std::fs::File;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::metadata::{ItemSubmission, MetadataError, MetadataSink, RunSummary, open_output};

pub struct CsvSink {
    tool_version: String,
    config_hash: String,
    items_writer: Mutex<csv::Writer<File>>,
    artefacts_writer: Mutex<csv::Writer<File>>,
    run_writer: Mutex<csv::Writer<File>>,
}

#[derive(Serialize)]
struct ItemCsv<'a> {
    run_id: &'a str,
    item_id: &'a str,
    name: &'a str,
    logical_path: &'a str,
    backing: &'a str,
    status: &'a str,
    size: Option<u64>,
    content_hash: Option<&'a str>,
    duplicate_of: Option<&'a str>,
    content_type: Option<&'a str>,
    /// Remaining task metadata as a JSON object.
    metadata: String,
    text_runs: usize,
    tool_version: &'a str,
    config_hash: &'a str,
}

#[derive(Serialize)]
struct ArtefactCsv<'a> {
    run_id: &'a str,
    item_id: &'a str,
    artefact_kind: &'a str,
    value: &'a str,
    offset: u64,
}

#[derive(Serialize)]
struct RunSummaryCsv<'a> {
    run_id: &'a str,
    case: &'a str,
    outcome: &'a str,
    enumerated: u64,
    done: u64,
    failed: u64,
    duplicates: u64,
    pending: u64,
    bytes_processed: u64,
    elapsed_seconds: f64,
    tool_version: &'a str,
    config_hash: &'a str,
}

const ITEM_HEADERS: &[&str] = &[
    "run_id",
    "item_id",
    "name",
    "logical_path",
    "backing",
    "status",
    "size",
    "content_hash",
    "duplicate_of",
    "content_type",
    "metadata",
    "text_runs",
    "tool_version",
    "config_hash",
];

const ARTEFACT_HEADERS: &[&str] = &["run_id", "item_id", "artefact_kind", "value", "offset"];

const RUN_HEADERS: &[&str] = &[
    "run_id",
    "case",
    "outcome",
    "enumerated",
    "done",
    "failed",
    "duplicates",
    "pending",
    "bytes_processed",
    "elapsed_seconds",
    "tool_version",
    "config_hash",
];

impl CsvSink {
    pub fn new(
        tool_version: &str,
        config_hash: &str,
        meta_dir: &Path,
        append: bool,
    ) -> Result<Self, MetadataError> {
        let items_writer = open_writer(&meta_dir.join("items.csv"), ITEM_HEADERS, append)?;
        let artefacts_writer =
            open_writer(&meta_dir.join("artefacts.csv"), ARTEFACT_HEADERS, append)?;
        let run_writer = open_writer(&meta_dir.join("run_summary.csv"), RUN_HEADERS, append)?;

        Ok(Self {
            tool_version: tool_version.to_string(),
            config_hash: config_hash.to_string(),
            items_writer: Mutex::new(items_writer),
            artefacts_writer: Mutex::new(artefacts_writer),
            run_writer: Mutex::new(run_writer),
        })
    }
}

fn open_writer(
    path: &Path,
    headers: &[&str],
    append: bool,
) -> Result<csv::Writer<File>, MetadataError> {
    let (file, had_content) = open_output(path, append)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if !had_content {
        writer.write_record(headers)?;
    }
    Ok(writer)
}

impl MetadataSink for CsvSink {
    fn submit(&self, submission: &ItemSubmission<'_>) -> Result<(), MetadataError> {
        let item = submission.item;
        let metadata = submission.metadata();
        let content_type = metadata.get("content_type").and_then(|v| v.as_str());
        let rest: serde_json::Map<String, serde_json::Value> = metadata
            .iter()
            .filter(|(key, _)| key.as_str() != "content_type")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let record = ItemCsv {
            run_id: submission.run_id,
            item_id: item.id().as_str(),
            name: item.name(),
            logical_path: &item.descriptor.logical_path,
            backing: item.descriptor.backing.kind(),
            status: submission.status.as_str(),
            size: item.size,
            content_hash: submission.content_hash(),
            duplicate_of: submission.duplicate_of(),
            content_type,
            metadata: serde_json::to_string(&rest)?,
            text_runs: submission.derived().text.len(),
            tool_version: &self.tool_version,
            config_hash: &self.config_hash,
        };
        {
            let mut guard = self
                .items_writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard.serialize(record)?;
        }

        let artefacts = &submission.derived().artefacts;
        if !artefacts.is_empty() {
            let mut guard = self
                .artefacts_writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for artefact in artefacts {
                guard.serialize(ArtefactCsv {
                    run_id: submission.run_id,
                    item_id: item.id().as_str(),
                    artefact_kind: &artefact.kind,
                    value: &artefact.value,
                    offset: artefact.offset,
                })?;
            }
        }
        Ok(())
    }

    fn record_run_summary(&self, summary: &RunSummary) -> Result<(), MetadataError> {
        let record = RunSummaryCsv {
            run_id: &summary.run_id,
            case: &summary.case,
            outcome: &summary.outcome,
            enumerated: summary.enumerated,
            done: summary.done,
            failed: summary.failed,
            duplicates: summary.duplicates,
            pending: summary.pending,
            bytes_processed: summary.bytes_processed,
            elapsed_seconds: summary.elapsed_seconds,
            tool_version: &self.tool_version,
            config_hash: &self.config_hash,
        };
        let mut guard = self.run_writer.lock().unwrap_or_else(PoisonError::into_inner);
        guard.serialize(record)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), MetadataError> {
        self.items_writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;
        self.artefacts_writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;
        self.run_writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;
        Ok(())
    }
}
