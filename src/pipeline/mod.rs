//! # Pipeline Module
//!
//! Runs a case through the task chain: one producer thread enumerates the
//! evidence into a bounded queue, a pool of workers drains it, and a
//! recorder thread journals every finalized item into the run state.
//!
//! A run is driven through [`Manager`], which hands back a [`RunHandle`]
//! for cancellation, progress polling and the final [`RunReport`].

pub mod events;
pub mod workers;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, bounded};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::chain::TaskChain;
use crate::checkpoint::{FailureKind, RunPhase, RunState, read_header};
use crate::config::{Config, LoadedConfig};
use crate::constants::{CHANNEL_CAPACITY_MULTIPLIER, MIN_CHANNEL_CAPACITY, QUEUE_POLL_INTERVAL_MS};
use crate::dedup::DedupCache;
use crate::evidence::{CaseDescriptor, EvidenceSource, open_case};
use crate::item::{ContentHash, EvidenceDescriptor, ItemId, ItemStatus};
use crate::metadata::{MetadataSink, RunSummary};
use crate::tasks::TaskRegistry;

use events::RecorderEvent;
use workers::WorkerContext;

/// Progress snapshot reported during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Items seen by the producer this session, including ones finalized earlier.
    pub enumerated: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub done: u64,
    pub failed: u64,
    pub duplicates: u64,
    /// Items abandoned mid-chain by cancellation; they are pending again.
    pub interrupted: u64,
    pub bytes_processed: u64,
    pub sink_errors: u64,
    pub elapsed_seconds: f64,
    pub items_per_second: f64,
    pub throughput_mib: f64,
}

impl ProgressSnapshot {
    pub fn finalized(&self) -> u64 {
        self.done + self.failed + self.duplicates
    }
}

/// Progress callback trait for long-running runs.
pub trait ProgressReporter: Send + Sync {
    fn on_progress(&self, snapshot: &ProgressSnapshot);
}

#[derive(Clone)]
pub struct ProgressConfig {
    pub reporter: Arc<dyn ProgressReporter>,
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Stopped by request; resumable.
    Cancelled,
    /// Stopped by a run-fatal error; resumable once the cause is fixed.
    Paused { reason: String },
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::Paused { .. } => "paused",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub id: ItemId,
    pub name: String,
    pub kind: FailureKind,
    pub task: Option<String>,
    pub reason: String,
    /// Set when the item was hashed before it failed.
    pub content_hash: Option<ContentHash>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub case: String,
    pub state_dir: PathBuf,
    pub outcome: RunOutcome,
    pub stats: ProgressSnapshot,
    /// Every failed item known to the run state, sorted by id.
    pub failures: Vec<ItemFailure>,
    /// Enumeration errors that did not yield an item.
    pub enumeration_errors: Vec<String>,
}

#[derive(Default)]
pub(crate) struct PipelineCounters {
    pub enumerated: AtomicU64,
    pub in_progress: AtomicU64,
    pub done: AtomicU64,
    pub failed: AtomicU64,
    pub duplicates: AtomicU64,
    pub interrupted: AtomicU64,
    pub bytes_processed: AtomicU64,
    pub sink_errors: AtomicU64,
}

/// State shared between a running session and its handle.
struct RunShared {
    cancel: Arc<AtomicBool>,
    counters: Arc<PipelineCounters>,
    fatal: Arc<Mutex<Option<String>>>,
    started: Instant,
    /// Items and bytes finalized by earlier sessions.
    baseline_finalized: u64,
    baseline_bytes: u64,
}

impl RunShared {
    fn snapshot(&self) -> ProgressSnapshot {
        let c = &self.counters;
        let enumerated = c.enumerated.load(Ordering::Relaxed);
        let in_progress = c.in_progress.load(Ordering::Relaxed);
        let done = c.done.load(Ordering::Relaxed);
        let failed = c.failed.load(Ordering::Relaxed);
        let duplicates = c.duplicates.load(Ordering::Relaxed);
        let bytes_processed = c.bytes_processed.load(Ordering::Relaxed);
        let finalized = done + failed + duplicates;
        let elapsed = self.started.elapsed().as_secs_f64();
        let session_items = finalized.saturating_sub(self.baseline_finalized);
        let session_bytes = bytes_processed.saturating_sub(self.baseline_bytes);
        let (items_per_second, throughput_mib) = if elapsed > 0.0 {
            (
                session_items as f64 / elapsed,
                session_bytes as f64 / (1024.0 * 1024.0) / elapsed,
            )
        } else {
            (0.0, 0.0)
        };
        ProgressSnapshot {
            enumerated,
            pending: enumerated
                .saturating_sub(finalized)
                .saturating_sub(in_progress),
            in_progress,
            done,
            failed,
            duplicates,
            interrupted: c.interrupted.load(Ordering::Relaxed),
            bytes_processed,
            sink_errors: c.sink_errors.load(Ordering::Relaxed),
            elapsed_seconds: elapsed,
            items_per_second,
            throughput_mib,
        }
    }

    fn fatal_reason(&self) -> Option<String> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_fatal(&self, reason: String) {
        let mut slot = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert(reason);
        self.cancel.store(true, Ordering::SeqCst);
    }
}

/// Handle to a run executing in the background.
pub struct RunHandle {
    run_id: String,
    state_dir: PathBuf,
    shared: Arc<RunShared>,
    join: thread::JoinHandle<Result<RunReport>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Stops dequeuing; in-flight items finish or are interrupted at their
    /// next task checkpoint. Idempotent.
    pub fn cancel(&self) {
        if !self.shared.cancel.swap(true, Ordering::SeqCst) {
            info!("run {} cancel requested", self.run_id);
        }
    }

    /// The flag `cancel` raises, for wiring into signal handlers.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.shared.cancel.clone()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.shared.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Blocks until the run stops and returns its report.
    pub fn wait(self) -> Result<RunReport> {
        self.join
            .join()
            .map_err(|_| anyhow!("run {} coordinator thread panicked", self.run_id))?
    }
}

/// Starts and resumes runs against one task registry and metadata sink.
pub struct Manager {
    registry: Arc<TaskRegistry>,
    sink: Arc<dyn MetadataSink>,
    progress: Option<ProgressConfig>,
}

impl Manager {
    pub fn new(registry: Arc<TaskRegistry>, sink: Arc<dyn MetadataSink>) -> Self {
        Self {
            registry,
            sink,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressConfig) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Starts a new run over the case's evidence roots.
    pub fn start(
        &self,
        case: CaseDescriptor,
        loaded: LoadedConfig,
        state_dir: &Path,
    ) -> Result<RunHandle> {
        let source = open_case(
            &case,
            loaded.config.resolver_limits(),
            loaded.config.expand_archives,
        )
        .with_context(|| format!("open case {}", case.name))?;
        self.start_with_source(Arc::new(source), case, loaded, state_dir)
    }

    /// Starts a new run over an arbitrary source. `case` is persisted for
    /// reporting and for [`Manager::resume`].
    pub fn start_with_source(
        &self,
        source: Arc<dyn EvidenceSource>,
        case: CaseDescriptor,
        loaded: LoadedConfig,
        state_dir: &Path,
    ) -> Result<RunHandle> {
        let LoadedConfig {
            mut config,
            config_hash,
        } = loaded;
        if config.run_id.is_empty() {
            config.run_id = crate::config::generate_run_id();
        }
        let chain = TaskChain::build(&config.chain, &self.registry)?;
        let state = RunState::create(state_dir, &config, &config_hash, &case, chain.task_ids())
            .with_context(|| format!("create run state in {}", state_dir.display()))?;
        info!(
            "run {} started case={} chain={} state_dir={}",
            config.run_id,
            case.name,
            chain.task_ids().join(","),
            state_dir.display()
        );
        self.launch(Arc::new(config), case.name, source, chain, state)
    }

    /// Resumes an interrupted or paused run from its state directory, with
    /// the configuration persisted there.
    pub fn resume(&self, state_dir: &Path) -> Result<RunHandle> {
        let header = read_header(state_dir)
            .with_context(|| format!("read run state in {}", state_dir.display()))?;
        let source = open_case(
            &header.case,
            header.config.resolver_limits(),
            header.config.expand_archives,
        )
        .with_context(|| format!("open case {}", header.case.name))?;
        self.resume_with_source(Arc::new(source), state_dir)
    }

    pub fn resume_with_source(
        &self,
        source: Arc<dyn EvidenceSource>,
        state_dir: &Path,
    ) -> Result<RunHandle> {
        let state = RunState::load(state_dir)
            .with_context(|| format!("load run state in {}", state_dir.display()))?;
        let header = state.header();
        let config = header.config.clone();
        let chain = TaskChain::build(&config.chain, &self.registry)?;
        if chain.task_ids() != header.chain {
            return Err(anyhow!(
                "persisted chain {:?} does not match its configuration {:?}",
                header.chain,
                chain.task_ids()
            ));
        }
        let counters = state.counters();
        info!(
            "run {} resumed case={} done={} failed={} duplicates={}",
            config.run_id, header.case.name, counters.done, counters.failed, counters.duplicates
        );
        let case_name = header.case.name.clone();
        self.launch(Arc::new(config), case_name, source, chain, state)
    }

    fn launch(
        &self,
        config: Arc<Config>,
        case_name: String,
        source: Arc<dyn EvidenceSource>,
        chain: TaskChain,
        state: RunState,
    ) -> Result<RunHandle> {
        let baseline = state.counters();
        let counters = Arc::new(PipelineCounters::default());
        counters.done.store(baseline.done, Ordering::Relaxed);
        counters.failed.store(baseline.failed, Ordering::Relaxed);
        counters.duplicates.store(baseline.duplicates, Ordering::Relaxed);
        counters
            .bytes_processed
            .store(baseline.bytes_processed, Ordering::Relaxed);

        let shared = Arc::new(RunShared {
            cancel: Arc::new(AtomicBool::new(false)),
            counters,
            fatal: Arc::new(Mutex::new(None)),
            started: Instant::now(),
            baseline_finalized: baseline.finalized(),
            baseline_bytes: baseline.bytes_processed,
        });

        let dedup = if config.dedup {
            let cache = DedupCache::default();
            let mut seeded = 0usize;
            for (hash, entry) in state.canonical_entries() {
                if cache.seed(hash, entry) {
                    seeded += 1;
                }
            }
            if seeded > 0 {
                info!("dedup cache seeded with {seeded} canonical entries");
            }
            Some(Arc::new(cache))
        } else {
            None
        };

        let run_id = config.run_id.clone();
        let state_dir = state.dir().to_path_buf();
        let runner = PipelineRunner {
            config,
            case_name,
            source,
            chain: Arc::new(chain),
            sink: self.sink.clone(),
            dedup,
            progress: self.progress.clone(),
            shared: shared.clone(),
            state,
        };
        let join = thread::Builder::new()
            .name("caseflow-run".into())
            .spawn(move || runner.run())
            .context("spawn run coordinator thread")?;
        Ok(RunHandle {
            run_id,
            state_dir,
            shared,
            join,
        })
    }
}

struct PipelineChannels {
    work_tx: Sender<EvidenceDescriptor>,
    work_rx: Receiver<EvidenceDescriptor>,
    record_tx: Sender<RecorderEvent>,
    record_rx: Receiver<RecorderEvent>,
}

struct ProduceOutcome {
    enumeration_errors: Vec<String>,
}

struct PipelineRunner {
    config: Arc<Config>,
    case_name: String,
    source: Arc<dyn EvidenceSource>,
    chain: Arc<TaskChain>,
    sink: Arc<dyn MetadataSink>,
    dedup: Option<Arc<DedupCache>>,
    progress: Option<ProgressConfig>,
    shared: Arc<RunShared>,
    state: RunState,
}

impl PipelineRunner {
    fn run(self) -> Result<RunReport> {
        let PipelineRunner {
            config,
            case_name,
            source,
            chain,
            sink,
            dedup,
            progress,
            shared,
            state,
        } = self;

        let workers = config.worker_count();
        let channels = setup_channels(&config, workers);
        let finalized: HashSet<ItemId> = state
            .records()
            .filter(|r| r.status.is_terminal())
            .map(|r| r.id.clone())
            .collect();
        let state_dir = state.dir().to_path_buf();
        info!(
            "workers={} queue_capacity={} already_finalized={}",
            workers,
            channels.work_tx.capacity().unwrap_or(0),
            finalized.len()
        );

        let recorder = workers::spawn_recorder_thread(
            state,
            channels.record_rx.clone(),
            shared.cancel.clone(),
            shared.fatal.clone(),
        )
        .context("spawn recorder thread")?;

        let ctx = Arc::new(WorkerContext {
            run_id: config.run_id.clone(),
            config: config.clone(),
            source: source.clone(),
            chain,
            dedup,
            sink: sink.clone(),
            cancel: shared.cancel.clone(),
            counters: shared.counters.clone(),
            record_tx: channels.record_tx.clone(),
        });
        let (worker_handles, spawn_error) =
            workers::spawn_item_workers(workers, channels.work_rx.clone(), ctx.clone());
        if let Some(err) = spawn_error {
            error!(
                "worker spawn failed after {} workers: {err}",
                worker_handles.len()
            );
            shared.set_fatal(format!("cannot start worker thread: {err}"));
        }
        drop(ctx);

        let PipelineChannels {
            work_tx,
            work_rx,
            record_tx,
            record_rx,
        } = channels;
        drop(work_rx);
        drop(record_rx);

        let mut reporter = ProgressTicker::new(progress, &shared);
        let produced = produce(
            source.as_ref(),
            &work_tx,
            &finalized,
            &shared,
            &mut reporter,
            &record_tx,
        );
        drop(work_tx);

        while !worker_handles.iter().all(|h| h.is_finished()) {
            thread::sleep(Duration::from_millis(QUEUE_POLL_INTERVAL_MS));
            reporter.tick(&shared, &record_tx);
        }
        for handle in worker_handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
                shared.set_fatal("worker thread panicked".to_string());
            }
        }
        drop(record_tx);
        let mut state = recorder
            .join()
            .map_err(|_| anyhow!("recorder thread panicked"))?;

        let outcome = match shared.fatal_reason() {
            Some(reason) => RunOutcome::Paused { reason },
            None if shared.cancel.load(Ordering::SeqCst) => RunOutcome::Cancelled,
            None => RunOutcome::Completed,
        };
        let (phase, reason) = match &outcome {
            RunOutcome::Completed => (RunPhase::Completed, None),
            RunOutcome::Cancelled => (RunPhase::Interrupted, None),
            RunOutcome::Paused { reason } => (RunPhase::Paused, Some(reason.clone())),
        };
        if let Err(err) = state.finish(phase, reason) {
            warn!("failed to write final run state: {err}");
        }

        let stats = shared.snapshot();
        reporter.finish(&stats);
        let summary = RunSummary {
            run_id: config.run_id.clone(),
            case: case_name.clone(),
            outcome: outcome.as_str().to_string(),
            enumerated: stats.enumerated,
            done: stats.done,
            failed: stats.failed,
            duplicates: stats.duplicates,
            pending: stats.pending,
            bytes_processed: stats.bytes_processed,
            elapsed_seconds: stats.elapsed_seconds,
        };
        if let Err(err) = sink.record_run_summary(&summary) {
            warn!("failed to record run summary: {err}");
        }
        if let Err(err) = sink.flush() {
            warn!("failed to flush metadata sink: {err}");
        }

        let mut failures: Vec<ItemFailure> = state
            .records()
            .filter(|r| r.status == ItemStatus::Failed)
            .filter_map(|r| {
                r.failure.as_ref().map(|f| ItemFailure {
                    id: r.id.clone(),
                    name: r.name.clone(),
                    kind: f.kind,
                    task: f.task.clone(),
                    reason: f.reason.clone(),
                    content_hash: r.content_hash.clone(),
                })
            })
            .collect();
        failures.sort_by(|a, b| a.id.cmp(&b.id));

        info!(
            "run {} {} enumerated={} done={} failed={} duplicates={} pending={} interrupted={} bytes={} elapsed={:.2}s",
            config.run_id,
            outcome.as_str(),
            stats.enumerated,
            stats.done,
            stats.failed,
            stats.duplicates,
            stats.pending,
            stats.interrupted,
            stats.bytes_processed,
            stats.elapsed_seconds
        );

        Ok(RunReport {
            run_id: config.run_id.clone(),
            case: case_name,
            state_dir,
            outcome,
            stats,
            failures,
            enumeration_errors: produced.enumeration_errors,
        })
    }
}

fn setup_channels(config: &Config, workers: usize) -> PipelineChannels {
    let channel_cap = if config.queue_capacity > 0 {
        config.queue_capacity
    } else {
        workers
            .saturating_mul(CHANNEL_CAPACITY_MULTIPLIER)
            .max(MIN_CHANNEL_CAPACITY)
    };
    let (work_tx, work_rx) = bounded::<EvidenceDescriptor>(channel_cap);
    let (record_tx, record_rx) = bounded::<RecorderEvent>(channel_cap * 2);
    PipelineChannels {
        work_tx,
        work_rx,
        record_tx,
        record_rx,
    }
}

/// Enumerates the source into the work queue, skipping items already
/// finalized. Stops early on cancellation.
fn produce(
    source: &dyn EvidenceSource,
    work_tx: &Sender<EvidenceDescriptor>,
    finalized: &HashSet<ItemId>,
    shared: &RunShared,
    reporter: &mut ProgressTicker,
    record_tx: &Sender<RecorderEvent>,
) -> ProduceOutcome {
    let mut outcome = ProduceOutcome {
        enumeration_errors: Vec::new(),
    };
    let poll = Duration::from_millis(QUEUE_POLL_INTERVAL_MS);
    let iter = match source.enumerate() {
        Ok(iter) => iter,
        Err(err) => {
            error!("evidence enumeration failed: {err}");
            shared.set_fatal(format!("evidence enumeration failed: {err}"));
            return outcome;
        }
    };

    for entry in iter {
        if shared.cancel.load(Ordering::Relaxed) {
            break;
        }
        let mut descriptor = match entry {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!("enumeration error: {err}");
                outcome.enumeration_errors.push(err.to_string());
                continue;
            }
        };
        shared.counters.enumerated.fetch_add(1, Ordering::Relaxed);
        if finalized.contains(&descriptor.id) {
            continue;
        }
        loop {
            match work_tx.send_timeout(descriptor, poll) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(returned)) => {
                    if shared.cancel.load(Ordering::Relaxed) {
                        return outcome;
                    }
                    descriptor = returned;
                    reporter.tick(shared, record_tx);
                }
                Err(SendTimeoutError::Disconnected(returned)) => {
                    if !shared.cancel.load(Ordering::SeqCst) {
                        error!("no worker left to take item {}", returned.id);
                        shared.set_fatal(
                            "all workers stopped before the queue drained".to_string(),
                        );
                    }
                    return outcome;
                }
            }
        }
        reporter.tick(shared, record_tx);
    }
    outcome
}

/// Emits progress at the configured interval and asks the recorder for a
/// header snapshot each time.
struct ProgressTicker {
    progress: Option<ProgressConfig>,
    interval: Duration,
    last: Instant,
}

impl ProgressTicker {
    fn new(progress: Option<ProgressConfig>, shared: &RunShared) -> Self {
        let interval = progress
            .as_ref()
            .map(|p| p.interval)
            .unwrap_or(Duration::from_secs(1));
        Self {
            progress,
            interval,
            last: shared.started,
        }
    }

    fn tick(&mut self, shared: &RunShared, record_tx: &Sender<RecorderEvent>) {
        if self.last.elapsed() < self.interval {
            return;
        }
        self.last = Instant::now();
        let _ = record_tx.try_send(RecorderEvent::Snapshot);
        if let Some(progress) = &self.progress {
            progress.reporter.on_progress(&shared.snapshot());
        }
    }

    fn finish(&self, stats: &ProgressSnapshot) {
        if let Some(progress) = &self.progress {
            progress.reporter.on_progress(stats);
        }
    }
}
