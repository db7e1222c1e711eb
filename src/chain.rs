//! # Task Chain
//!
//! The immutable, ordered list of tasks every item of a run flows through.
//! Tasks run strictly in configured order for one item; a failing or
//! panicking task ends that item's chain and nothing else.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{debug, trace};

use crate::config::TaskSpec;
use crate::dedup::{Claim, DedupCache};
use crate::item::{EvidenceItem, ItemId};
use crate::stream::SeekableStream;
use crate::tasks::{
    ProcessingContext, ProcessingTask, TaskCapabilities, TaskError, TaskOutcome, TaskRegistry,
};

struct ChainStep {
    id: String,
    caps: TaskCapabilities,
    task: Arc<dyn ProcessingTask>,
}

pub struct TaskChain {
    steps: Vec<ChainStep>,
}

#[derive(Debug)]
pub enum ChainResult {
    Completed,
    /// Content already seen; heavy tasks were skipped.
    Duplicate { canonical: ItemId },
    Failed { task: String, error: TaskError },
    /// A task observed cancellation; the item is not finalized.
    Interrupted,
}

impl TaskChain {
    pub fn build(specs: &[TaskSpec], registry: &TaskRegistry) -> Result<Self> {
        if specs.is_empty() {
            bail!("task chain is empty");
        }
        let mut steps = Vec::with_capacity(specs.len());
        for spec in specs {
            if steps.iter().any(|s: &ChainStep| s.id == spec.id) {
                bail!("task {} appears twice in the chain", spec.id);
            }
            let task = registry.build(spec)?;
            steps.push(ChainStep {
                id: spec.id.clone(),
                caps: task.capabilities(),
                task,
            });
        }
        Ok(Self { steps })
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs every step for one item.
    ///
    /// The dedup cache is consulted once, right after the first step that
    /// leaves a content hash in the context.
    pub fn run(
        &self,
        item: &mut EvidenceItem,
        stream: &mut dyn SeekableStream,
        ctx: &mut ProcessingContext,
        dedup: Option<&DedupCache>,
    ) -> ChainResult {
        let mut canonical: Option<ItemId> = None;
        let mut hash_checked = false;

        for step in &self.steps {
            if canonical.is_some() && step.caps.heavy {
                trace!("item {} skips heavy task {} as duplicate", item.id(), step.id);
                continue;
            }

            let applied = {
                let item: &EvidenceItem = item;
                catch_unwind(AssertUnwindSafe(|| step.task.apply(item, stream, ctx)))
            };
            let outcome = match applied {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(TaskError::Interrupted)) => return ChainResult::Interrupted,
                Ok(Err(error)) => {
                    return ChainResult::Failed {
                        task: step.id.clone(),
                        error,
                    };
                }
                Err(payload) => {
                    return ChainResult::Failed {
                        task: step.id.clone(),
                        error: TaskError::Panicked(panic_message(payload.as_ref())),
                    };
                }
            };

            if !hash_checked && let Some(hash) = ctx.content_hash().cloned() {
                hash_checked = true;
                item.content_hash = Some(hash.clone());
                if let Some(cache) = dedup
                    && let Claim::Duplicate(entry) = cache.claim(&hash, item)
                {
                    debug!("item {} duplicates {}", item.id(), entry.item);
                    ctx.set_duplicate_of(entry.item.clone());
                    canonical = Some(entry.item);
                }
            }

            if outcome == TaskOutcome::SkipRemaining {
                trace!("task {} stopped the chain for {}", step.id, item.id());
                break;
            }
        }

        match canonical {
            Some(canonical) => ChainResult::Duplicate { canonical },
            None => ChainResult::Completed,
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::item::ContentHash;
    use crate::stream::EvidenceStream;
    use crate::tasks::tests::{context, item_named};

    /// Records its id into a shared log; optionally fails, panics or hashes.
    struct Scripted {
        id: &'static str,
        heavy: bool,
        log: Arc<Mutex<Vec<String>>>,
        behaviour: Behaviour,
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Pass,
        Fail,
        Panic,
        Hash,
        Stop,
    }

    impl ProcessingTask for Scripted {
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
            self.log.lock().expect("log").push(format!("{}:{}", self.id, item.name()));
            match self.behaviour {
                Behaviour::Pass => Ok(TaskOutcome::Continue),
                Behaviour::Fail => Err(TaskError::Invalid("malformed".into())),
                Behaviour::Panic => panic!("scripted task exploded"),
                Behaviour::Hash => {
                    ctx.set_content_hash(ContentHash::new("aa"));
                    Ok(TaskOutcome::Continue)
                }
                Behaviour::Stop => Ok(TaskOutcome::SkipRemaining),
            }
        }
    }

    fn chain_of(steps: &[(&'static str, bool, Behaviour)]) -> (TaskChain, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = TaskRegistry::new();
        let mut specs = Vec::new();
        for &(id, heavy, behaviour) in steps {
            let log = log.clone();
            registry.register(id, move |_| {
                Ok(Arc::new(Scripted {
                    id,
                    heavy,
                    log: log.clone(),
                    behaviour,
                }))
            });
            specs.push(TaskSpec::new(id));
        }
        (TaskChain::build(&specs, &registry).expect("chain"), log)
    }

    fn run(chain: &TaskChain, name: &str, dedup: Option<&DedupCache>) -> ChainResult {
        let mut item = item_named(name, 1);
        let mut stream = EvidenceStream::from_bytes(vec![1]);
        let mut ctx = context();
        chain.run(&mut item, &mut stream, &mut ctx, dedup)
    }

    #[test]
    fn tasks_run_in_configured_order() {
        let (chain, log) = chain_of(&[
            ("b", false, Behaviour::Pass),
            ("a", false, Behaviour::Pass),
            ("c", true, Behaviour::Pass),
        ]);
        assert!(matches!(run(&chain, "x", None), ChainResult::Completed));
        assert_eq!(*log.lock().expect("log"), vec!["b:x", "a:x", "c:x"]);
    }

    #[test]
    fn failure_names_the_task_and_stops_the_chain() {
        let (chain, log) = chain_of(&[
            ("Hash", false, Behaviour::Pass),
            ("Parse", true, Behaviour::Fail),
            ("Index", true, Behaviour::Pass),
        ]);
        match run(&chain, "y", None) {
            ChainResult::Failed { task, .. } => assert_eq!(task, "Parse"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(*log.lock().expect("log"), vec!["Hash:y", "Parse:y"]);
    }

    #[test]
    fn panics_become_item_failures() {
        let (chain, _) = chain_of(&[("boom", false, Behaviour::Panic)]);
        match run(&chain, "z", None) {
            ChainResult::Failed {
                task,
                error: TaskError::Panicked(msg),
            } => {
                assert_eq!(task, "boom");
                assert!(msg.contains("scripted task exploded"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicates_skip_heavy_tasks_only() {
        let (chain, log) = chain_of(&[
            ("hash", false, Behaviour::Hash),
            ("parse", true, Behaviour::Pass),
            ("props", false, Behaviour::Pass),
        ]);
        let cache = DedupCache::default();
        assert!(matches!(run(&chain, "first", Some(&cache)), ChainResult::Completed));
        match run(&chain, "second", Some(&cache)) {
            ChainResult::Duplicate { canonical } => assert_eq!(canonical.as_str(), "t:first"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            *log.lock().expect("log"),
            vec![
                "hash:first",
                "parse:first",
                "props:first",
                "hash:second",
                "props:second"
            ]
        );
    }

    #[test]
    fn skip_remaining_ends_the_chain_successfully() {
        let (chain, log) = chain_of(&[
            ("gate", false, Behaviour::Stop),
            ("never", false, Behaviour::Pass),
        ]);
        assert!(matches!(run(&chain, "s", None), ChainResult::Completed));
        assert_eq!(*log.lock().expect("log"), vec!["gate:s"]);
    }

    #[test]
    fn duplicate_task_ids_are_rejected() {
        let registry = TaskRegistry::with_builtin();
        let specs = vec![TaskSpec::new("hash"), TaskSpec::new("hash")];
        assert!(TaskChain::build(&specs, &registry).is_err());
    }
}
