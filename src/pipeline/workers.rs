//! # Pipeline Workers
//!
//! Worker threads that claim evidence items, run the task chain over them
//! and hand terminal records to the recorder thread.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::chain::{ChainResult, TaskChain, panic_message};
use crate::checkpoint::{FailureKind, FailureRecord, ItemRecord, RunState};
use crate::config::Config;
use crate::constants::QUEUE_POLL_INTERVAL_MS;
use crate::dedup::DedupCache;
use crate::evidence::{EvidenceError, EvidenceSource};
use crate::item::{EvidenceDescriptor, EvidenceItem, ItemStatus};
use crate::metadata::{ItemSubmission, MetadataError, MetadataSink};
use crate::stream::SeekableStream;
use crate::tasks::{ItemOutput, ProcessingContext};

use super::PipelineCounters;
use super::events::RecorderEvent;

/// Everything a worker needs, shared by all workers of one run.
pub(crate) struct WorkerContext {
    pub run_id: String,
    pub config: Arc<Config>,
    pub source: Arc<dyn EvidenceSource>,
    pub chain: Arc<TaskChain>,
    pub dedup: Option<Arc<DedupCache>>,
    pub sink: Arc<dyn MetadataSink>,
    pub cancel: Arc<AtomicBool>,
    pub counters: Arc<PipelineCounters>,
    pub record_tx: Sender<RecorderEvent>,
}

/// Spawns up to `count` workers. A spawn failure stops spawning and is
/// returned next to the handles that did start.
pub(crate) fn spawn_item_workers(
    count: usize,
    rx: Receiver<EvidenceDescriptor>,
    ctx: Arc<WorkerContext>,
) -> (Vec<thread::JoinHandle<()>>, Option<std::io::Error>) {
    let mut handles = Vec::with_capacity(count);
    for index in 0..count {
        let rx = rx.clone();
        let ctx = ctx.clone();
        let spawned = thread::Builder::new()
            .name(format!("caseflow-worker-{index}"))
            .spawn(move || worker_loop(&rx, &ctx));
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(err) => return (handles, Some(err)),
        }
    }
    (handles, None)
}

fn worker_loop(rx: &Receiver<EvidenceDescriptor>, ctx: &WorkerContext) {
    let poll = Duration::from_millis(QUEUE_POLL_INTERVAL_MS);
    loop {
        if ctx.cancel.load(Ordering::Relaxed) {
            break;
        }
        let descriptor = match rx.recv_timeout(poll) {
            Ok(descriptor) => descriptor,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        // Cancellation may land between dequeue and claim; the item stays pending.
        if ctx.cancel.load(Ordering::Relaxed) {
            debug!("item {} left pending after cancel", descriptor.id);
            break;
        }
        process_item(descriptor, ctx);
    }
}

enum Finish {
    Done(ItemOutput),
    Duplicate(ItemOutput),
    Failed(FailureRecord, ItemOutput),
    Interrupted,
}

pub(crate) fn process_item(descriptor: EvidenceDescriptor, ctx: &WorkerContext) {
    let mut item = EvidenceItem::new(descriptor);
    if let Err(err) = item.transition(ItemStatus::InProgress) {
        warn!("item {}: {err}", item.id());
        return;
    }
    ctx.counters.in_progress.fetch_add(1, Ordering::Relaxed);

    // Decoders run inside `open`; a panic there fails the item, not the worker.
    let opened = catch_unwind(AssertUnwindSafe(|| ctx.source.open(&item.descriptor)))
        .unwrap_or_else(|payload| {
            Err(EvidenceError::open_failed(
                &item.descriptor.name,
                format!("panicked: {}", panic_message(payload.as_ref())),
            ))
        });

    let finish = match opened {
        Ok(mut stream) => {
            if item.size.is_none() {
                item.size = stream.size().ok();
            }
            let mut pctx = ProcessingContext::new(ctx.config.clone(), ctx.cancel.clone());
            let result = ctx
                .chain
                .run(&mut item, &mut stream, &mut pctx, ctx.dedup.as_deref());
            // Released before the item's status is finalized.
            stream.close();
            let output = pctx.into_output();
            match result {
                ChainResult::Completed => Finish::Done(output),
                ChainResult::Duplicate { .. } => Finish::Duplicate(output),
                ChainResult::Failed { task, error } => Finish::Failed(
                    FailureRecord {
                        kind: FailureKind::TaskFailed,
                        task: Some(task),
                        reason: error.to_string(),
                    },
                    output,
                ),
                ChainResult::Interrupted => Finish::Interrupted,
            }
        }
        Err(err) => Finish::Failed(
            FailureRecord {
                kind: FailureKind::OpenFailed,
                task: None,
                reason: err.to_string(),
            },
            ItemOutput::default(),
        ),
    };

    let (status, output, failure) = match finish {
        Finish::Interrupted => {
            if let Err(err) = item.transition(ItemStatus::Pending) {
                warn!("item {}: {err}", item.id());
            }
            ctx.counters.in_progress.fetch_sub(1, Ordering::Relaxed);
            ctx.counters.interrupted.fetch_add(1, Ordering::Relaxed);
            debug!("item {} interrupted, left pending", item.id());
            return;
        }
        Finish::Done(output) => submit(ctx, &item, ItemStatus::Done, output),
        Finish::Duplicate(output) => submit(ctx, &item, ItemStatus::SkippedDuplicate, output),
        Finish::Failed(failure, output) => (ItemStatus::Failed, output, Some(failure)),
    };

    if let Err(err) = item.transition(status) {
        warn!("item {}: {err}", item.id());
    }
    if let Some(failure) = &failure {
        warn!(
            "item {} failed kind={} task={} reason={}",
            item.id(),
            failure.kind.as_str(),
            failure.task.as_deref().unwrap_or("-"),
            failure.reason
        );
    }

    // A hash only counts once the chain claimed it in the dedup cache.
    let content_hash = match status {
        ItemStatus::Failed => item.content_hash.clone(),
        _ => output.content_hash.clone(),
    };
    let metadata = match status {
        ItemStatus::Failed => output.metadata,
        _ => Default::default(),
    };
    let record = ItemRecord {
        id: item.id().clone(),
        name: item.name().to_string(),
        status,
        size: item.size,
        content_hash,
        duplicate_of: output.duplicate_of,
        failure,
        metadata,
        finished_at: Utc::now(),
    };
    if ctx
        .record_tx
        .send(RecorderEvent::Finished(Box::new(record)))
        .is_err()
    {
        warn!("recorder gone; item {} not journaled", item.id());
    }

    let counters = &ctx.counters;
    match status {
        ItemStatus::Done => counters.done.fetch_add(1, Ordering::Relaxed),
        ItemStatus::SkippedDuplicate => counters.duplicates.fetch_add(1, Ordering::Relaxed),
        _ => counters.failed.fetch_add(1, Ordering::Relaxed),
    };
    counters
        .bytes_processed
        .fetch_add(item.size.unwrap_or(0), Ordering::Relaxed);
    counters.in_progress.fetch_sub(1, Ordering::Relaxed);
}

/// Hands a successful item to the sink. A sink error or panic turns it into a failure.
fn submit(
    ctx: &WorkerContext,
    item: &EvidenceItem,
    status: ItemStatus,
    output: ItemOutput,
) -> (ItemStatus, ItemOutput, Option<FailureRecord>) {
    let submission = ItemSubmission {
        run_id: &ctx.run_id,
        item,
        status,
        output: &output,
    };
    let submitted = catch_unwind(AssertUnwindSafe(|| ctx.sink.submit(&submission)))
        .unwrap_or_else(|payload| {
            Err(MetadataError::Other(format!(
                "sink panicked: {}",
                panic_message(payload.as_ref())
            )))
        });
    match submitted {
        Ok(()) => (status, output, None),
        Err(err) => {
            ctx.counters.sink_errors.fetch_add(1, Ordering::Relaxed);
            (
                ItemStatus::Failed,
                output,
                Some(FailureRecord {
                    kind: FailureKind::SubmissionFailed,
                    task: None,
                    reason: err.to_string(),
                }),
            )
        }
    }
}

/// Owns the run state for the lifetime of a session. The first write
/// failure stores its reason, raises the cancel flag and stops journaling;
/// the state is handed back when every sender is gone.
pub(crate) fn spawn_recorder_thread(
    mut state: RunState,
    rx: Receiver<RecorderEvent>,
    cancel: Arc<AtomicBool>,
    fatal: Arc<Mutex<Option<String>>>,
) -> std::io::Result<thread::JoinHandle<RunState>> {
    thread::Builder::new()
        .name("caseflow-recorder".into())
        .spawn(move || {
            let mut failed = false;
            for event in rx.iter() {
                if failed {
                    continue;
                }
                let result = match event {
                    RecorderEvent::Finished(record) => state.record(*record),
                    RecorderEvent::Snapshot => state.snapshot(),
                };
                if let Err(err) = result {
                    error!("run state write failed: {err}; pausing run");
                    let mut slot = fatal.lock().unwrap_or_else(PoisonError::into_inner);
                    slot.get_or_insert_with(|| format!("run state write failed: {err}"));
                    cancel.store(true, Ordering::SeqCst);
                    failed = true;
                }
            }
            info!("recorder finished records={}", state.counters().finalized());
            state
        })
}
