//! # Processing Tasks
//!
//! The contract every stage of a task chain implements, the per-item
//! extraction context tasks write into, and the registry that turns the
//! configured task identifiers into task instances.

pub mod entropy;
pub mod hash;
pub mod properties;
pub mod signature;
pub mod strings;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::{Config, TaskOptions, TaskSpec};
use crate::constants::{MAX_EMPTY_READS, READ_BUFFER_SIZE};
use crate::item::{ContentHash, EvidenceItem, ItemId};
use crate::stream::{ReadResult, SeekableStream, StreamError};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid content: {0}")]
    Invalid(String),
    #[error("interrupted by cancellation")]
    Interrupted,
    #[error("item deadline of {0:?} exceeded")]
    TimedOut(Duration),
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Continue,
    /// Stop the chain for this item; the item still finishes Done.
    SkipRemaining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskCapabilities {
    pub reads_content: bool,
    /// Heavy tasks are skipped for duplicate content.
    pub heavy: bool,
}

pub trait ProcessingTask: Send + Sync {
    fn id(&self) -> &str;
    fn capabilities(&self) -> TaskCapabilities;
    fn apply(
        &self,
        item: &EvidenceItem,
        stream: &mut dyn SeekableStream,
        ctx: &mut ProcessingContext,
    ) -> Result<TaskOutcome, TaskError>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Artefact {
    pub kind: String,
    pub value: String,
    pub offset: u64,
}

/// Content derived from an item, handed to the sink next to its metadata.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DerivedContent {
    pub text: Vec<String>,
    pub artefacts: Vec<Artefact>,
}

impl DerivedContent {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.artefacts.is_empty()
    }
}

/// Mutable per-item state threaded through every task of the chain.
pub struct ProcessingContext {
    config: Arc<Config>,
    cancel: Arc<AtomicBool>,
    started: Instant,
    deadline: Option<Duration>,
    metadata: BTreeMap<String, Value>,
    derived: DerivedContent,
    content_hash: Option<ContentHash>,
    duplicate_of: Option<ItemId>,
}

/// What a finished chain leaves behind for the sink.
#[derive(Debug, Clone, Default)]
pub struct ItemOutput {
    pub metadata: BTreeMap<String, Value>,
    pub derived: DerivedContent,
    pub content_hash: Option<ContentHash>,
    pub duplicate_of: Option<ItemId>,
}

impl ProcessingContext {
    pub fn new(config: Arc<Config>, cancel: Arc<AtomicBool>) -> Self {
        let deadline = match config.item_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self {
            config,
            cancel,
            started: Instant::now(),
            deadline,
            metadata: BTreeMap::new(),
            derived: DerivedContent::default(),
            content_hash: None,
            duplicate_of: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn derived_mut(&mut self) -> &mut DerivedContent {
        &mut self.derived
    }

    pub fn set_content_hash(&mut self, hash: ContentHash) {
        self.content_hash = Some(hash);
    }

    pub fn content_hash(&self) -> Option<&ContentHash> {
        self.content_hash.as_ref()
    }

    pub fn duplicate_of(&self) -> Option<&ItemId> {
        self.duplicate_of.as_ref()
    }

    pub(crate) fn set_duplicate_of(&mut self, canonical: ItemId) {
        self.insert("duplicate_of", canonical.as_str());
        self.duplicate_of = Some(canonical);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Cooperative interruption point for long-running tasks.
    ///
    /// Cancellation only interrupts when `interrupt_in_flight` is set; the
    /// per-item deadline always applies.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.config.interrupt_in_flight && self.is_cancelled() {
            return Err(TaskError::Interrupted);
        }
        if let Some(limit) = self.deadline
            && self.started.elapsed() > limit
        {
            return Err(TaskError::TimedOut(limit));
        }
        Ok(())
    }

    pub fn into_output(self) -> ItemOutput {
        ItemOutput {
            metadata: self.metadata,
            derived: self.derived,
            content_hash: self.content_hash,
            duplicate_of: self.duplicate_of,
        }
    }
}

/// Streams the item from offset 0 in blocks, stopping after `max_bytes`.
///
/// Calls `ctx.checkpoint()` before every block. Returns the bytes visited.
pub(crate) fn scan_content<F>(
    stream: &mut dyn SeekableStream,
    ctx: &ProcessingContext,
    max_bytes: Option<u64>,
    mut visit: F,
) -> Result<u64, TaskError>
where
    F: FnMut(u64, &[u8]) -> Result<(), TaskError>,
{
    stream.seek(0)?;
    let limit = max_bytes.unwrap_or(u64::MAX);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut offset = 0u64;
    let mut empty_reads = 0u32;
    while offset < limit {
        ctx.checkpoint()?;
        let want = (limit - offset).min(buf.len() as u64) as usize;
        match stream.read(&mut buf[..want])? {
            ReadResult::Eof => break,
            ReadResult::Bytes(0) => {
                empty_reads += 1;
                if empty_reads >= MAX_EMPTY_READS {
                    return Err(TaskError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream made no progress",
                    )));
                }
            }
            ReadResult::Bytes(n) => {
                empty_reads = 0;
                visit(offset, &buf[..n])?;
                offset += n as u64;
            }
        }
    }
    Ok(offset)
}

pub(crate) fn option_u64(options: &TaskOptions, key: &str, default: u64) -> Result<u64> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .ok_or_else(|| anyhow!("option {key} must be a non-negative integer, got {value}")),
    }
}

pub(crate) fn option_strings(options: &TaskOptions, key: &str) -> Result<Option<Vec<String>>> {
    let Some(value) = options.get(key) else {
        return Ok(None);
    };
    let Some(items) = value.as_array() else {
        bail!("option {key} must be a list of strings");
    };
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("option {key} must be a list of strings"))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

pub type TaskFactory =
    Box<dyn Fn(&TaskOptions) -> Result<Arc<dyn ProcessingTask>> + Send + Sync>;

/// Catalog of task identifiers available to chain configurations.
#[derive(Default)]
pub struct TaskRegistry {
    factories: HashMap<String, TaskFactory>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(properties::ID, |_| Ok(Arc::new(properties::PropertiesTask)));
        registry.register(hash::ID, |options| {
            Ok(Arc::new(hash::HashTask::from_options(options)?))
        });
        registry.register(signature::ID, |_| Ok(Arc::new(signature::SignatureTask)));
        registry.register(strings::ID, |options| {
            Ok(Arc::new(strings::StringsTask::from_options(options)?))
        });
        registry.register(entropy::ID, |options| {
            Ok(Arc::new(entropy::EntropyTask::from_options(options)?))
        });
        registry
    }

    /// Adds or replaces the factory for `id`.
    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(&TaskOptions) -> Result<Arc<dyn ProcessingTask>> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Box::new(factory));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn build(&self, spec: &TaskSpec) -> Result<Arc<dyn ProcessingTask>> {
        let factory = self
            .factories
            .get(&spec.id)
            .ok_or_else(|| anyhow!("unknown task id: {}", spec.id))?;
        factory(&spec.options).map_err(|e| anyhow!("task {}: {e}", spec.id))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::item::{Backing, EvidenceDescriptor};

    pub(crate) fn item_named(name: &str, size: u64) -> EvidenceItem {
        EvidenceItem::new(EvidenceDescriptor {
            id: ItemId::new(format!("t:{name}")),
            name: name.to_string(),
            logical_path: format!("case/{name}"),
            backing: Backing::Memory {
                key: name.to_string(),
            },
            size: Some(size),
            modified: None,
        })
    }

    pub(crate) fn context() -> ProcessingContext {
        ProcessingContext::new(Arc::new(Config::default()), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn builtin_registry_knows_default_chain() {
        let registry = TaskRegistry::with_builtin();
        assert_eq!(
            registry.ids(),
            vec!["entropy", "hash", "properties", "signature", "strings"]
        );
        assert!(registry.build(&TaskSpec::new("ocr")).is_err());
    }

    #[test]
    fn bad_options_are_rejected_at_build_time() {
        let registry = TaskRegistry::with_builtin();
        let mut spec = TaskSpec::new("strings");
        spec.options.insert("min_len".into(), serde_json::json!("six"));
        let err = registry.build(&spec).err().expect("invalid option");
        assert!(err.to_string().contains("min_len"));
    }

    #[test]
    fn checkpoint_reports_cancellation() {
        let cancel = Arc::new(AtomicBool::new(false));
        let config = Config {
            interrupt_in_flight: true,
            ..Config::default()
        };
        let ctx = ProcessingContext::new(Arc::new(config), cancel.clone());
        assert!(ctx.checkpoint().is_ok());
        cancel.store(true, Ordering::Relaxed);
        assert!(matches!(ctx.checkpoint(), Err(TaskError::Interrupted)));
    }

    #[test]
    fn in_flight_items_finish_by_default() {
        let cancel = Arc::new(AtomicBool::new(true));
        let ctx = ProcessingContext::new(Arc::new(Config::default()), cancel);
        assert!(ctx.is_cancelled());
        assert!(ctx.checkpoint().is_ok());
    }

    #[test]
    fn scan_content_honours_max_bytes() {
        let mut stream = crate::stream::EvidenceStream::from_bytes(vec![7u8; 1000]);
        let ctx = context();
        let mut seen = 0usize;
        let visited = scan_content(&mut stream, &ctx, Some(300), |_, block| {
            seen += block.len();
            Ok(())
        })
        .expect("scan");
        assert_eq!(visited, 300);
        assert_eq!(seen, 300);
    }
}
