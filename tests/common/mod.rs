//! Shared test infrastructure for pipeline tests.
//!
//! An in-memory evidence source, a handful of scripted tasks, and helpers
//! to drive a run to completion and read back its output.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use caseflow::config::{Config, LoadedConfig, TaskSpec};
use caseflow::evidence::{CaseDescriptor, DescriptorIter, EvidenceError, EvidenceSource};
use caseflow::item::{Backing, EvidenceDescriptor, EvidenceItem, ItemId};
use caseflow::metadata::{ItemSubmission, MetadataError, MetadataSink, RunSummary};
use caseflow::pipeline::{Manager, RunReport};
use caseflow::stream::{EvidenceStream, SeekableStream};
use caseflow::tasks::{
    ProcessingContext, ProcessingTask, TaskCapabilities, TaskError, TaskOutcome, TaskRegistry,
};

// ============================================================================
// Evidence
// ============================================================================

/// Items held in memory, enumerated in insertion order. Names listed in
/// `unopenable` enumerate normally but fail to open; `panicking` ones panic.
#[derive(Default)]
pub struct MemorySource {
    items: Vec<(String, Vec<u8>)>,
    unopenable: Vec<String>,
    panicking: Vec<String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, data: &[u8]) -> Self {
        self.items.push((name.to_string(), data.to_vec()));
        self
    }

    pub fn unopenable(mut self, name: &str) -> Self {
        self.items.push((name.to_string(), Vec::new()));
        self.unopenable.push(name.to_string());
        self
    }

    pub fn panicking(mut self, name: &str) -> Self {
        self.items.push((name.to_string(), Vec::new()));
        self.panicking.push(name.to_string());
        self
    }

    pub fn ids(&self) -> Vec<ItemId> {
        self.items.iter().map(|(name, _)| id_of(name)).collect()
    }
}

pub fn id_of(name: &str) -> ItemId {
    ItemId::new(format!("mem:{name}"))
}

impl EvidenceSource for MemorySource {
    fn enumerate(&self) -> Result<DescriptorIter<'_>, EvidenceError> {
        Ok(Box::new(self.items.iter().map(|(name, data)| {
            Ok(EvidenceDescriptor {
                id: id_of(name),
                name: name.clone(),
                logical_path: name.clone(),
                backing: Backing::Memory { key: name.clone() },
                size: Some(data.len() as u64),
                modified: None,
            })
        })))
    }

    fn open(&self, descriptor: &EvidenceDescriptor) -> Result<EvidenceStream, EvidenceError> {
        if self.panicking.contains(&descriptor.name) {
            panic!("decoder crashed on {}", descriptor.name);
        }
        if self.unopenable.contains(&descriptor.name) {
            return Err(EvidenceError::open_failed(&descriptor.name, "permission denied"));
        }
        self.items
            .iter()
            .find(|(name, _)| *name == descriptor.name)
            .map(|(_, data)| EvidenceStream::from_bytes(data.clone()))
            .ok_or_else(|| EvidenceError::open_failed(&descriptor.name, "no such item"))
    }
}

pub fn memory_case() -> CaseDescriptor {
    CaseDescriptor::new("memory", Vec::new())
}

// ============================================================================
// Scripted tasks
// ============================================================================

/// Counts `apply` calls per item name.
#[derive(Clone, Default)]
pub struct Tally(Arc<Mutex<HashMap<String, usize>>>);

impl Tally {
    pub fn count(&self, name: &str) -> usize {
        self.0.lock().expect("tally").get(name).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.lock().expect("tally").values().sum()
    }

    fn bump(&self, name: &str) {
        *self.0.lock().expect("tally").entry(name.to_string()).or_default() += 1;
    }
}

pub struct CountTask {
    pub id: &'static str,
    pub heavy: bool,
    pub tally: Tally,
}

impl ProcessingTask for CountTask {
    fn id(&self) -> &str {
        self.id
    }

    fn capabilities(&self) -> TaskCapabilities {
        TaskCapabilities {
            reads_content: false,
            heavy: self.heavy,
        }
    }

    fn apply(
        &self,
        item: &EvidenceItem,
        _stream: &mut dyn SeekableStream,
        ctx: &mut ProcessingContext,
    ) -> Result<TaskOutcome, TaskError> {
        self.tally.bump(item.name());
        ctx.insert(format!("{}_ran", self.id), true);
        Ok(TaskOutcome::Continue)
    }
}

/// Fails (or panics) for the named items, passes everything else.
pub struct FailTask {
    pub targets: Vec<String>,
    pub panic: bool,
}

impl ProcessingTask for FailTask {
    fn id(&self) -> &str {
        if self.panic { "explode" } else { "parse" }
    }

    fn capabilities(&self) -> TaskCapabilities {
        TaskCapabilities::default()
    }

    fn apply(
        &self,
        item: &EvidenceItem,
        _stream: &mut dyn SeekableStream,
        _ctx: &mut ProcessingContext,
    ) -> Result<TaskOutcome, TaskError> {
        if self.targets.iter().any(|t| t == item.name()) {
            if self.panic {
                panic!("parser blew up on {}", item.name());
            }
            return Err(TaskError::Invalid(format!("cannot parse {}", item.name())));
        }
        Ok(TaskOutcome::Continue)
    }
}

/// Holds every worker that enters it until released. An interruptible gate
/// also gives up at the next cooperative checkpoint.
#[derive(Default)]
pub struct Gate {
    pub entered: AtomicUsize,
    released: AtomicBool,
}

impl Gate {
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

pub struct GateTask {
    pub gate: Arc<Gate>,
    pub interruptible: bool,
    /// Only these items wait; empty means all.
    pub only: Vec<String>,
}

impl ProcessingTask for GateTask {
    fn id(&self) -> &str {
        "gate"
    }

    fn capabilities(&self) -> TaskCapabilities {
        TaskCapabilities::default()
    }

    fn apply(
        &self,
        item: &EvidenceItem,
        _stream: &mut dyn SeekableStream,
        ctx: &mut ProcessingContext,
    ) -> Result<TaskOutcome, TaskError> {
        if !self.only.is_empty() && !self.only.iter().any(|n| n == item.name()) {
            return Ok(TaskOutcome::Continue);
        }
        self.gate.entered.fetch_add(1, Ordering::SeqCst);
        while !self.gate.released.load(Ordering::SeqCst) {
            if self.interruptible {
                ctx.checkpoint()?;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(TaskOutcome::Continue)
    }
}

// ============================================================================
// Sinks
// ============================================================================

#[derive(Debug, Clone)]
pub struct Submitted {
    pub id: String,
    pub status: String,
    pub duplicate_of: Option<String>,
    pub metadata: serde_json::Map<String, Value>,
}

/// Keeps every submission in memory. Items named in `reject` fail to
/// submit; items named in `panic_on` panic inside `submit`.
#[derive(Default)]
pub struct RecordingSink {
    pub items: Mutex<Vec<Submitted>>,
    pub summaries: Mutex<Vec<RunSummary>>,
    pub reject: Vec<String>,
    pub panic_on: Vec<String>,
}

impl RecordingSink {
    pub fn submitted(&self) -> Vec<Submitted> {
        self.items.lock().expect("items").clone()
    }

    pub fn find(&self, name: &str) -> Option<Submitted> {
        let id = id_of(name);
        self.submitted().into_iter().find(|s| s.id == id.as_str())
    }
}

impl MetadataSink for RecordingSink {
    fn submit(&self, submission: &ItemSubmission<'_>) -> Result<(), MetadataError> {
        if self.panic_on.iter().any(|n| n == submission.item.name()) {
            panic!("index writer crashed on {}", submission.item.name());
        }
        if self.reject.iter().any(|n| n == submission.item.name()) {
            return Err(MetadataError::Other("index unavailable".into()));
        }
        self.items.lock().expect("items").push(Submitted {
            id: submission.item.id().as_str().to_string(),
            status: submission.status.as_str().to_string(),
            duplicate_of: submission.duplicate_of().map(str::to_string),
            metadata: submission
                .metadata()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        });
        Ok(())
    }

    fn record_run_summary(&self, summary: &RunSummary) -> Result<(), MetadataError> {
        self.summaries.lock().expect("summaries").push(summary.clone());
        Ok(())
    }

    fn flush(&self) -> Result<(), MetadataError> {
        Ok(())
    }
}

// ============================================================================
// Run helpers
// ============================================================================

pub fn config_with_chain(ids: &[&str], workers: usize) -> LoadedConfig {
    let config = Config {
        run_id: "test_run".to_string(),
        workers,
        progress_interval_ms: 50,
        chain: ids.iter().map(|id| TaskSpec::new(*id)).collect(),
        ..Config::default()
    };
    LoadedConfig::from_config(config).expect("config")
}

pub fn run_memory(
    manager: &Manager,
    source: MemorySource,
    loaded: LoadedConfig,
    state_dir: &Path,
) -> RunReport {
    manager
        .start_with_source(Arc::new(source), memory_case(), loaded, state_dir)
        .expect("start")
        .wait()
        .expect("run")
}

/// Registry with `count` (light) and `heavy` (heavy) tallies on top of the built-ins.
pub fn registry_with_tally(tally: &Tally) -> TaskRegistry {
    let mut registry = TaskRegistry::with_builtin();
    let light = tally.clone();
    registry.register("count", move |_| {
        Ok(Arc::new(CountTask {
            id: "count",
            heavy: false,
            tally: light.clone(),
        }))
    });
    let heavy = tally.clone();
    registry.register("heavy", move |_| {
        Ok(Arc::new(CountTask {
            id: "heavy",
            heavy: true,
            tally: heavy.clone(),
        }))
    });
    registry
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub fn read_jsonl(path: &Path) -> Vec<Value> {
    let content = std::fs::read_to_string(path).expect("jsonl read");
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("json"))
        .collect()
}
