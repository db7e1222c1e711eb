//! # Run State
//!
//! Persisted resume state for one run, kept in a state directory:
//!
//! - `run_state.json`: header with the run configuration, case, phase and
//!   counters. Replaced atomically (temp file, fsync, rename).
//! - `items.jsonl`: append-only journal with one line per finalized item.
//!
//! The journal is the source of truth. A crash can at worst leave a torn
//! trailing line, which is discarded on load; every complete line before it
//! stays valid.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::constants::{JOURNAL_FILE_NAME, STATE_FILE_NAME, STATE_FORMAT_VERSION};
use crate::dedup::CanonicalEntry;
use crate::evidence::CaseDescriptor;
use crate::item::{ContentHash, ItemId, ItemStatus};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("run state mismatch: {0}")]
    Mismatch(String),
    #[error("run in {0} already completed")]
    Completed(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Running,
    /// Stopped by cancellation; resumable.
    Interrupted,
    /// Stopped by a run-fatal error; resumable once the cause is fixed.
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub done: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub bytes_processed: u64,
}

impl RunCounters {
    pub fn finalized(&self) -> u64 {
        self.done + self.failed + self.duplicates
    }

    fn add(&mut self, record: &ItemRecord) {
        match record.status {
            ItemStatus::Done => self.done += 1,
            ItemStatus::Failed => self.failed += 1,
            ItemStatus::SkippedDuplicate => self.duplicates += 1,
            ItemStatus::Pending | ItemStatus::InProgress => {}
        }
        self.bytes_processed += record.size.unwrap_or(0);
    }

    fn remove(&mut self, record: &ItemRecord) {
        match record.status {
            ItemStatus::Done => self.done = self.done.saturating_sub(1),
            ItemStatus::Failed => self.failed = self.failed.saturating_sub(1),
            ItemStatus::SkippedDuplicate => self.duplicates = self.duplicates.saturating_sub(1),
            ItemStatus::Pending | ItemStatus::InProgress => {}
        }
        self.bytes_processed = self
            .bytes_processed
            .saturating_sub(record.size.unwrap_or(0));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub version: u32,
    pub run_id: String,
    pub config_hash: String,
    pub config: Config,
    pub case: CaseDescriptor,
    pub chain: Vec<String>,
    pub phase: RunPhase,
    #[serde(default)]
    pub pause_reason: Option<String>,
    pub counters: RunCounters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    OpenFailed,
    TaskFailed,
    SubmissionFailed,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::OpenFailed => "open_failed",
            FailureKind::TaskFailed => "task_failed",
            FailureKind::SubmissionFailed => "submission_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    #[serde(default)]
    pub task: Option<String>,
    pub reason: String,
}

/// One journal line: the terminal state of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    pub name: String,
    pub status: ItemStatus,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub content_hash: Option<ContentHash>,
    #[serde(default)]
    pub duplicate_of: Option<ItemId>,
    #[serde(default)]
    pub failure: Option<FailureRecord>,
    /// Metadata gathered before a failure; empty for other records.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    pub finished_at: DateTime<Utc>,
}

pub struct RunState {
    dir: PathBuf,
    header: CheckpointState,
    journal: File,
    records: HashMap<ItemId, ItemRecord>,
    since_snapshot: u64,
}

impl RunState {
    /// Starts a new run in `dir`. Refuses a directory that already holds a run.
    pub fn create(
        dir: &Path,
        config: &Config,
        config_hash: &str,
        case: &CaseDescriptor,
        chain: Vec<String>,
    ) -> Result<Self, CheckpointError> {
        std::fs::create_dir_all(dir)?;
        let state_path = dir.join(STATE_FILE_NAME);
        if state_path.exists() {
            return Err(CheckpointError::Mismatch(format!(
                "{} already holds a run; resume it or choose another state directory",
                dir.display()
            )));
        }
        let journal = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(dir.join(JOURNAL_FILE_NAME))?;
        let now = Utc::now();
        let header = CheckpointState {
            version: STATE_FORMAT_VERSION,
            run_id: config.run_id.clone(),
            config_hash: config_hash.to_string(),
            config: config.clone(),
            case: case.clone(),
            chain,
            phase: RunPhase::Running,
            pause_reason: None,
            counters: RunCounters::default(),
            created_at: now,
            updated_at: now,
        };
        let mut state = Self {
            dir: dir.to_path_buf(),
            header,
            journal,
            records: HashMap::new(),
            since_snapshot: 0,
        };
        state.write_header()?;
        info!("run state created in {}", dir.display());
        Ok(state)
    }

    /// Reopens an unfinished run for resumption.
    pub fn load(dir: &Path) -> Result<Self, CheckpointError> {
        let header = read_header(dir)?;
        if header.phase == RunPhase::Completed {
            return Err(CheckpointError::Completed(dir.to_path_buf()));
        }
        if header.version != STATE_FORMAT_VERSION {
            return Err(CheckpointError::Mismatch(format!(
                "state format version {} is not supported (expected {STATE_FORMAT_VERSION})",
                header.version
            )));
        }

        let journal_path = dir.join(JOURNAL_FILE_NAME);
        let records = read_journal(&journal_path)?;
        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)?;

        let mut counters = RunCounters::default();
        for record in records.values() {
            counters.add(record);
        }
        if counters != header.counters {
            debug!(
                "journal counters {:?} supersede header counters {:?}",
                counters, header.counters
            );
        }

        let mut state = Self {
            dir: dir.to_path_buf(),
            header,
            journal,
            records,
            since_snapshot: 0,
        };
        state.header.counters = counters;
        state.header.phase = RunPhase::Running;
        state.header.pause_reason = None;
        state.write_header()?;
        info!(
            "run state loaded from {} with {} finalized items",
            dir.display(),
            state.records.len()
        );
        Ok(state)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn header(&self) -> &CheckpointState {
        &self.header
    }

    pub fn counters(&self) -> RunCounters {
        self.header.counters
    }

    pub fn is_finalized(&self, id: &ItemId) -> bool {
        self.records.contains_key(id)
    }

    /// Terminal status if recorded, otherwise `Pending`.
    pub fn status_of(&self, id: &ItemId) -> ItemStatus {
        self.records
            .get(id)
            .map(|r| r.status)
            .unwrap_or(ItemStatus::Pending)
    }

    pub fn record_of(&self, id: &ItemId) -> Option<&ItemRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &ItemRecord> {
        self.records.values()
    }

    /// Hash ownership recorded by earlier sessions, used to re-seed the dedup cache.
    ///
    /// Every record that claimed its hash counts, whatever its status. Links
    /// held by duplicates come after them, so a canonical item that never
    /// reached the journal keeps its slot.
    pub fn canonical_entries(&self) -> Vec<(ContentHash, CanonicalEntry)> {
        let claimed = self.records.values().filter_map(|record| {
            if record.duplicate_of.is_some() {
                return None;
            }
            let hash = record.content_hash.clone()?;
            Some((
                hash,
                CanonicalEntry {
                    item: record.id.clone(),
                    name: record.name.clone(),
                    size: record.size,
                },
            ))
        });
        let linked = self.records.values().filter_map(|record| {
            let canonical = record.duplicate_of.as_ref()?;
            let hash = record.content_hash.clone()?;
            let name = match self.records.get(canonical) {
                Some(owner) => owner.name.clone(),
                None => canonical.as_str().to_string(),
            };
            Some((
                hash,
                CanonicalEntry {
                    item: canonical.clone(),
                    name,
                    size: record.size,
                },
            ))
        });
        claimed.chain(linked).collect()
    }

    /// Appends a terminal item record to the journal.
    pub fn record(&mut self, record: ItemRecord) -> Result<(), CheckpointError> {
        if !record.status.is_terminal() {
            return Err(CheckpointError::Mismatch(format!(
                "item {} recorded with non-terminal status {}",
                record.id, record.status
            )));
        }
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.journal.write_all(&line)?;

        if let Some(previous) = self.records.insert(record.id.clone(), record.clone()) {
            self.header.counters.remove(&previous);
        }
        self.header.counters.add(&record);

        self.since_snapshot += 1;
        if self.since_snapshot >= self.header.config.checkpoint_interval.max(1) {
            self.snapshot()?;
        }
        Ok(())
    }

    /// Makes the journal durable and rewrites the header.
    pub fn snapshot(&mut self) -> Result<(), CheckpointError> {
        self.journal.sync_data()?;
        self.write_header()?;
        self.since_snapshot = 0;
        Ok(())
    }

    /// Records how the run ended. `Completed` states are never resumed.
    pub fn finish(
        &mut self,
        phase: RunPhase,
        reason: Option<String>,
    ) -> Result<(), CheckpointError> {
        self.header.phase = phase;
        self.header.pause_reason = reason;
        self.snapshot()
    }

    /// Forgets an item so that the next resume processes it again.
    ///
    /// The journal is compacted atomically without the item.
    pub fn clear_item(&mut self, id: &ItemId) -> Result<bool, CheckpointError> {
        let Some(previous) = self.records.remove(id) else {
            return Ok(false);
        };
        self.header.counters.remove(&previous);

        let journal_path = self.dir.join(JOURNAL_FILE_NAME);
        let mut ordered: Vec<&ItemRecord> = self.records.values().collect();
        ordered.sort_by(|a, b| a.finished_at.cmp(&b.finished_at));
        let mut body = Vec::new();
        for record in ordered {
            serde_json::to_writer(&mut body, record)?;
            body.push(b'\n');
        }
        write_atomic(&journal_path, &body)?;
        self.journal = OpenOptions::new().append(true).open(&journal_path)?;
        self.write_header()?;
        info!("cleared item {id} from run state");
        Ok(true)
    }

    fn write_header(&mut self) -> Result<(), CheckpointError> {
        self.header.updated_at = Utc::now();
        let body = serde_json::to_vec_pretty(&self.header)?;
        write_atomic(&self.dir.join(STATE_FILE_NAME), &body)?;
        Ok(())
    }
}

/// Reads the header of a state directory without opening it for writing.
pub fn read_header(dir: &Path) -> Result<CheckpointState, CheckpointError> {
    let data = std::fs::read(dir.join(STATE_FILE_NAME))?;
    Ok(serde_json::from_slice(&data)?)
}

/// Loads the journal, truncating a torn trailing line in place.
fn read_journal(path: &Path) -> Result<HashMap<ItemId, ItemRecord>, CheckpointError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(err.into()),
    };

    let mut records = HashMap::new();
    let mut offset = 0usize;
    let mut line_no = 0usize;
    while offset < data.len() {
        let Some(newline) = memchr::memchr(b'\n', &data[offset..]) else {
            warn!(
                "discarding torn trailing journal line in {} ({} bytes)",
                path.display(),
                data.len() - offset
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(offset as u64)?;
            file.sync_all()?;
            break;
        };
        line_no += 1;
        let line = &data[offset..offset + newline];
        offset += newline + 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<ItemRecord>(line) {
            Ok(record) => {
                records.insert(record.id.clone(), record);
            }
            Err(err) => warn!(
                "skipping unreadable journal line {line_no} in {}: {err}",
                path.display()
            ),
        }
    }
    Ok(records)
}

fn write_atomic(path: &Path, body: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(body)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    #[cfg(unix)]
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, status: ItemStatus) -> ItemRecord {
        ItemRecord {
            id: ItemId::new(id),
            name: id.to_string(),
            status,
            size: Some(10),
            content_hash: Some(ContentHash::new(format!("hash-{id}"))),
            duplicate_of: None,
            failure: None,
            metadata: BTreeMap::new(),
            finished_at: Utc::now(),
        }
    }

    fn config() -> Config {
        Config {
            run_id: "run-1".into(),
            checkpoint_interval: 2,
            ..Config::default()
        }
    }

    fn case() -> CaseDescriptor {
        CaseDescriptor::from_paths("case", &[PathBuf::from("/evidence")])
    }

    #[test]
    fn records_survive_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state =
            RunState::create(dir.path(), &config(), "abc", &case(), vec!["hash".into()])
                .expect("create");
        state.record(record("a", ItemStatus::Done)).expect("record");
        state.record(record("b", ItemStatus::Failed)).expect("record");
        state.record(record("c", ItemStatus::SkippedDuplicate)).expect("record");
        state.finish(RunPhase::Interrupted, None).expect("finish");
        drop(state);

        let state = RunState::load(dir.path()).expect("load");
        assert_eq!(state.status_of(&ItemId::new("a")), ItemStatus::Done);
        assert_eq!(state.status_of(&ItemId::new("b")), ItemStatus::Failed);
        assert_eq!(state.status_of(&ItemId::new("zzz")), ItemStatus::Pending);
        assert_eq!(state.counters().finalized(), 3);
        assert_eq!(state.counters().bytes_processed, 30);
        assert_eq!(state.header().phase, RunPhase::Running);
        assert_eq!(state.canonical_entries().len(), 3);
    }

    #[test]
    fn torn_trailing_line_is_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state =
            RunState::create(dir.path(), &config(), "abc", &case(), Vec::new()).expect("create");
        state.record(record("a", ItemStatus::Done)).expect("record");
        state.snapshot().expect("snapshot");
        drop(state);

        let journal = dir.path().join(JOURNAL_FILE_NAME);
        let mut file = OpenOptions::new().append(true).open(&journal).expect("open");
        file.write_all(b"{\"id\":\"b\",\"name\":\"b\",\"sta").expect("tear");
        drop(file);

        let mut state = RunState::load(dir.path()).expect("load");
        assert!(state.is_finalized(&ItemId::new("a")));
        assert!(!state.is_finalized(&ItemId::new("b")));
        state.record(record("b", ItemStatus::Done)).expect("record");
        drop(state);

        let state = RunState::load(dir.path()).expect("reload");
        assert_eq!(state.counters().done, 2);
    }

    #[test]
    fn completed_runs_are_not_resumed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state =
            RunState::create(dir.path(), &config(), "abc", &case(), Vec::new()).expect("create");
        state.finish(RunPhase::Completed, None).expect("finish");
        drop(state);
        assert!(matches!(
            RunState::load(dir.path()),
            Err(CheckpointError::Completed(_))
        ));
    }

    #[test]
    fn existing_state_is_not_overwritten() {
        let dir = tempfile::tempdir().expect("tempdir");
        RunState::create(dir.path(), &config(), "abc", &case(), Vec::new()).expect("create");
        assert!(matches!(
            RunState::create(dir.path(), &config(), "abc", &case(), Vec::new()),
            Err(CheckpointError::Mismatch(_))
        ));
    }

    #[test]
    fn cleared_items_become_pending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state =
            RunState::create(dir.path(), &config(), "abc", &case(), Vec::new()).expect("create");
        state.record(record("a", ItemStatus::Failed)).expect("record");
        state.record(record("b", ItemStatus::Done)).expect("record");
        assert!(state.clear_item(&ItemId::new("a")).expect("clear"));
        assert!(!state.clear_item(&ItemId::new("a")).expect("clear again"));
        state.finish(RunPhase::Interrupted, None).expect("finish");
        drop(state);

        let state = RunState::load(dir.path()).expect("load");
        assert_eq!(state.status_of(&ItemId::new("a")), ItemStatus::Pending);
        assert_eq!(state.status_of(&ItemId::new("b")), ItemStatus::Done);
        assert_eq!(state.counters().failed, 0);
    }

    #[test]
    fn non_terminal_records_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state =
            RunState::create(dir.path(), &config(), "abc", &case(), Vec::new()).expect("create");
        assert!(state.record(record("a", ItemStatus::InProgress)).is_err());
    }

    #[test]
    fn failed_canonicals_and_duplicate_links_are_reseeded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state =
            RunState::create(dir.path(), &config(), "abc", &case(), Vec::new()).expect("create");

        let mut failed = record("a", ItemStatus::Failed);
        failed.content_hash = Some(ContentHash::new("same"));
        state.record(failed).expect("record");

        let mut linked_to_failed = record("b", ItemStatus::SkippedDuplicate);
        linked_to_failed.content_hash = Some(ContentHash::new("same"));
        linked_to_failed.duplicate_of = Some(ItemId::new("a"));
        state.record(linked_to_failed).expect("record");

        // "x" never reached the journal; only its duplicate did.
        let mut orphan = record("c", ItemStatus::SkippedDuplicate);
        orphan.content_hash = Some(ContentHash::new("other"));
        orphan.duplicate_of = Some(ItemId::new("x"));
        state.record(orphan).expect("record");

        let cache = crate::dedup::DedupCache::default();
        for (hash, entry) in state.canonical_entries() {
            cache.seed(hash, entry);
        }
        let same = cache.get(&ContentHash::new("same")).expect("same seeded");
        assert_eq!(same.item, ItemId::new("a"));
        let other = cache.get(&ContentHash::new("other")).expect("other seeded");
        assert_eq!(other.item, ItemId::new("x"));
        assert_eq!(cache.len(), 2);
    }
}
