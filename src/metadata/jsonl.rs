use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;

use crate::metadata::{ItemSubmission, MetadataError, MetadataSink, RunSummary, open_output};
use crate::tasks::Artefact;

pub struct JsonlSink {
    tool_version: String,
    config_hash: String,
    items: Mutex<BufWriter<File>>,
    runs: Mutex<BufWriter<File>>,
}

#[derive(Serialize)]
struct ItemRecordJson<'a> {
    run_id: &'a str,
    item_id: &'a str,
    name: &'a str,
    logical_path: &'a str,
    backing: &'a str,
    status: &'a str,
    size: Option<u64>,
    content_hash: Option<&'a str>,
    duplicate_of: Option<&'a str>,
    metadata: &'a BTreeMap<String, Value>,
    text: &'a [String],
    artefacts: &'a [Artefact],
    tool_version: &'a str,
    config_hash: &'a str,
}

#[derive(Serialize)]
struct RunSummaryJson<'a> {
    #[serde(flatten)]
    summary: &'a RunSummary,
    tool_version: &'a str,
    config_hash: &'a str,
}

impl JsonlSink {
    pub fn new(
        tool_version: &str,
        config_hash: &str,
        meta_dir: &Path,
        append: bool,
    ) -> Result<Self, MetadataError> {
        let (items, _) = open_output(&meta_dir.join("items.jsonl"), append)?;
        let (runs, _) = open_output(&meta_dir.join("runs.jsonl"), append)?;
        Ok(Self {
            tool_version: tool_version.to_string(),
            config_hash: config_hash.to_string(),
            items: Mutex::new(BufWriter::new(items)),
            runs: Mutex::new(BufWriter::new(runs)),
        })
    }
}

impl MetadataSink for JsonlSink {
    fn submit(&self, submission: &ItemSubmission<'_>) -> Result<(), MetadataError> {
        let item = submission.item;
        let derived = submission.derived();
        let record = ItemRecordJson {
            run_id: submission.run_id,
            item_id: item.id().as_str(),
            name: item.name(),
            logical_path: &item.descriptor.logical_path,
            backing: item.descriptor.backing.kind(),
            status: submission.status.as_str(),
            size: item.size,
            content_hash: submission.content_hash(),
            duplicate_of: submission.duplicate_of(),
            metadata: submission.metadata(),
            text: &derived.text,
            artefacts: &derived.artefacts,
            tool_version: &self.tool_version,
            config_hash: &self.config_hash,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut guard = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        guard.write_all(&line)?;
        Ok(())
    }

    fn record_run_summary(&self, summary: &RunSummary) -> Result<(), MetadataError> {
        let record = RunSummaryJson {
            summary,
            tool_version: &self.tool_version,
            config_hash: &self.config_hash,
        };
        let mut guard = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *guard, &record)?;
        guard.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> Result<(), MetadataError> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;
        Ok(())
    }
}
