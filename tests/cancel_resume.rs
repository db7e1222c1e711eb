mod common;

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use caseflow::checkpoint::{CheckpointError, RunPhase, RunState, read_header};
use caseflow::item::ItemStatus;
use caseflow::pipeline::{Manager, RunOutcome};

use common::{
    FailTask, Gate, GateTask, MemorySource, RecordingSink, Tally, config_with_chain, id_of,
    memory_case, read_jsonl, registry_with_tally, run_memory, wait_until,
};

fn eight_items() -> MemorySource {
    (0..8).fold(MemorySource::new(), |source, i| {
        source.with(&format!("item{i}.bin"), format!("payload {i}").as_bytes())
    })
}

fn manager_with_gate(
    tally: &Tally,
    gate: &Arc<Gate>,
    interruptible: bool,
    only: Vec<String>,
    sink: Arc<RecordingSink>,
) -> Manager {
    let mut registry = registry_with_tally(tally);
    let gate = gate.clone();
    registry.register("gate", move |_| {
        Ok(Arc::new(GateTask {
            gate: gate.clone(),
            interruptible,
            only: only.clone(),
        }))
    });
    Manager::new(Arc::new(registry), sink)
}

#[test]
fn cancel_finishes_in_flight_items_and_leaves_the_rest_pending() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state_dir = dir.path().join("state");
    let tally = Tally::default();
    let gate = Arc::new(Gate::default());
    let sink = Arc::new(RecordingSink::default());
    let manager = manager_with_gate(&tally, &gate, false, Vec::new(), sink.clone());

    let source = eight_items();
    let ids = source.ids();
    let handle = manager
        .start_with_source(
            Arc::new(source),
            memory_case(),
            config_with_chain(&["gate", "count"], 4),
            &state_dir,
        )
        .expect("start");

    assert!(wait_until(Duration::from_secs(10), || {
        gate.entered.load(Ordering::SeqCst) == 4 && handle.progress().in_progress == 4
    }));
    handle.cancel();
    gate.release();
    let report = handle.wait().expect("run");

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.stats.done, 4);
    assert_eq!(report.stats.in_progress, 0);
    assert_eq!(tally.total(), 4);
    assert_eq!(sink.submitted().len(), 4);

    let header = read_header(&state_dir).expect("header");
    assert_eq!(header.phase, RunPhase::Interrupted);
    let state = RunState::load(&state_dir).expect("load");
    let statuses: Vec<ItemStatus> = ids.iter().map(|id| state.status_of(id)).collect();
    assert_eq!(statuses.iter().filter(|s| **s == ItemStatus::Done).count(), 4);
    assert_eq!(statuses.iter().filter(|s| **s == ItemStatus::Pending).count(), 4);
}

#[test]
fn resume_processes_only_unfinished_items() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state_dir = dir.path().join("state");
    let tally = Tally::default();
    let gate = Arc::new(Gate::default());

    let first_sink = Arc::new(RecordingSink::default());
    let manager = manager_with_gate(&tally, &gate, false, Vec::new(), first_sink.clone());
    let handle = manager
        .start_with_source(
            Arc::new(eight_items()),
            memory_case(),
            config_with_chain(&["gate", "count"], 4),
            &state_dir,
        )
        .expect("start");
    assert!(wait_until(Duration::from_secs(10), || {
        gate.entered.load(Ordering::SeqCst) == 4
    }));
    handle.cancel();
    gate.release();
    let first = handle.wait().expect("first session");
    assert_eq!(first.outcome, RunOutcome::Cancelled);
    let first_done: Vec<String> = first_sink.submitted().into_iter().map(|s| s.id).collect();

    let second_sink = Arc::new(RecordingSink::default());
    let manager = manager_with_gate(&tally, &gate, false, Vec::new(), second_sink.clone());
    let second = manager
        .resume_with_source(Arc::new(eight_items()), &state_dir)
        .expect("resume")
        .wait()
        .expect("second session");

    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(second.stats.done, 8);
    assert_eq!(second.stats.pending, 0);
    assert_eq!(second.stats.enumerated, 8);
    for i in 0..8 {
        assert_eq!(tally.count(&format!("item{i}.bin")), 1, "item{i} processed once");
    }
    let resubmitted: Vec<String> = second_sink.submitted().into_iter().map(|s| s.id).collect();
    assert_eq!(resubmitted.len(), 4);
    assert!(resubmitted.iter().all(|id| !first_done.contains(id)));
    assert_eq!(read_header(&state_dir).expect("header").phase, RunPhase::Completed);
}

#[test]
fn completed_run_is_not_resumed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state_dir = dir.path().join("state");
    let tally = Tally::default();
    let manager = Manager::new(
        Arc::new(registry_with_tally(&tally)),
        Arc::new(RecordingSink::default()),
    );
    let report = run_memory(
        &manager,
        eight_items(),
        config_with_chain(&["count"], 2),
        &state_dir,
    );
    assert_eq!(report.outcome, RunOutcome::Completed);

    let err = manager
        .resume_with_source(Arc::new(eight_items()), &state_dir)
        .err()
        .expect("completed state refused");
    assert!(matches!(
        err.downcast_ref::<CheckpointError>(),
        Some(CheckpointError::Completed(_))
    ));
    assert_eq!(tally.total(), 8);
}

#[test]
fn starting_over_an_existing_state_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state_dir = dir.path().join("state");
    let tally = Tally::default();
    let manager = Manager::new(
        Arc::new(registry_with_tally(&tally)),
        Arc::new(RecordingSink::default()),
    );
    run_memory(&manager, eight_items(), config_with_chain(&["count"], 2), &state_dir);
    let again = manager.start_with_source(
        Arc::new(eight_items()),
        memory_case(),
        config_with_chain(&["count"], 2),
        &state_dir,
    );
    assert!(again.is_err());
}

#[test]
fn torn_journal_tail_is_dropped_on_resume() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state_dir = dir.path().join("state");
    let tally = Tally::default();
    let gate = Arc::new(Gate::default());
    let manager = manager_with_gate(
        &tally,
        &gate,
        false,
        Vec::new(),
        Arc::new(RecordingSink::default()),
    );
    let handle = manager
        .start_with_source(
            Arc::new(eight_items()),
            memory_case(),
            config_with_chain(&["gate", "count"], 2),
            &state_dir,
        )
        .expect("start");
    assert!(wait_until(Duration::from_secs(10), || {
        gate.entered.load(Ordering::SeqCst) == 2
    }));
    handle.cancel();
    gate.release();
    handle.wait().expect("first session");

    // A crash mid-append leaves half a record behind.
    let mut journal = OpenOptions::new()
        .append(true)
        .open(state_dir.join("items.jsonl"))
        .expect("journal");
    journal
        .write_all(br#"{"id":"mem:item7.bin","name":"item7.bin","sta"#)
        .expect("torn write");
    drop(journal);

    let report = manager
        .resume_with_source(Arc::new(eight_items()), &state_dir)
        .expect("resume")
        .wait()
        .expect("second session");
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.stats.done, 8);
    assert_eq!(tally.count("item7.bin"), 1);

    let state_lines = std::fs::read_to_string(state_dir.join("items.jsonl")).expect("journal");
    for line in state_lines.lines() {
        serde_json::from_str::<serde_json::Value>(line).expect("every journal line parses");
    }
}

#[test]
fn interrupted_item_returns_to_pending_and_dedup_survives_resume() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state_dir = dir.path().join("state");
    let tally = Tally::default();
    let gate = Arc::new(Gate::default());
    let sink = Arc::new(RecordingSink::default());
    let manager = manager_with_gate(
        &tally,
        &gate,
        true,
        vec!["copy.txt".to_string()],
        sink.clone(),
    );
    let source = || {
        MemorySource::new()
            .with("original.txt", b"the same bytes")
            .with("copy.txt", b"the same bytes")
    };

    let mut loaded = config_with_chain(&["hash", "gate", "heavy"], 1);
    loaded.config.interrupt_in_flight = true;
    let handle = manager
        .start_with_source(Arc::new(source()), memory_case(), loaded, &state_dir)
        .expect("start");
    assert!(wait_until(Duration::from_secs(10), || {
        gate.entered.load(Ordering::SeqCst) == 1
    }));
    handle.cancel();
    let first = handle.wait().expect("first session");
    assert_eq!(first.outcome, RunOutcome::Cancelled);
    assert_eq!(first.stats.done, 1);
    assert_eq!(first.stats.interrupted, 1);
    assert_eq!(
        RunState::load(&state_dir)
            .expect("load")
            .status_of(&id_of("copy.txt")),
        ItemStatus::Pending
    );

    gate.release();
    let second = manager
        .resume_with_source(Arc::new(source()), &state_dir)
        .expect("resume")
        .wait()
        .expect("second session");
    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(second.stats.done, 1);
    assert_eq!(second.stats.duplicates, 1);

    let copy = sink.find("copy.txt").expect("copy submitted");
    assert_eq!(copy.status, "skipped_duplicate");
    assert_eq!(copy.duplicate_of.as_deref(), Some("mem:original.txt"));
    assert_eq!(tally.count("original.txt"), 1);
    assert_eq!(tally.count("copy.txt"), 0);
}

#[test]
fn failed_canonical_keeps_its_hash_across_resume() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state_dir = dir.path().join("state");
    let tally = Tally::default();
    let gate = Arc::new(Gate::default());
    let sink = Arc::new(RecordingSink::default());

    let mut registry = registry_with_tally(&tally);
    registry.register("parse", |_| {
        Ok(Arc::new(FailTask {
            targets: vec!["a.txt".to_string()],
            panic: false,
        }))
    });
    let gate_for_task = gate.clone();
    registry.register("gate", move |_| {
        Ok(Arc::new(GateTask {
            gate: gate_for_task.clone(),
            interruptible: true,
            only: vec!["d.txt".to_string()],
        }))
    });
    let manager = Manager::new(Arc::new(registry), sink.clone());
    let source = || {
        MemorySource::new()
            .with("a.txt", b"same")
            .with("b.txt", b"same")
            .with("d.txt", b"other")
            .with("c.txt", b"same")
    };

    let mut loaded = config_with_chain(&["hash", "parse", "gate", "heavy"], 1);
    loaded.config.interrupt_in_flight = true;
    let handle = manager
        .start_with_source(Arc::new(source()), memory_case(), loaded, &state_dir)
        .expect("start");
    assert!(wait_until(Duration::from_secs(10), || {
        gate.entered.load(Ordering::SeqCst) == 1
    }));
    handle.cancel();
    let first = handle.wait().expect("first session");
    assert_eq!(first.outcome, RunOutcome::Cancelled);
    assert_eq!(first.stats.failed, 1);
    assert_eq!(first.stats.duplicates, 1);
    assert_eq!(
        sink.find("b.txt").expect("b submitted").duplicate_of.as_deref(),
        Some("mem:a.txt")
    );

    gate.release();
    let second = manager
        .resume_with_source(Arc::new(source()), &state_dir)
        .expect("resume")
        .wait()
        .expect("second session");
    assert_eq!(second.outcome, RunOutcome::Completed);

    let c = sink.find("c.txt").expect("c submitted");
    assert_eq!(c.status, "skipped_duplicate");
    assert_eq!(c.duplicate_of.as_deref(), Some("mem:a.txt"));

    // Exactly one journal record owns the shared hash.
    let journal = read_jsonl(&state_dir.join("items.jsonl"));
    let a = journal
        .iter()
        .find(|r| r["id"] == "mem:a.txt")
        .expect("a journaled");
    let same_hash = a["content_hash"].clone();
    assert!(same_hash.is_string(), "failed canonical keeps its hash");
    let owners: Vec<&serde_json::Value> = journal
        .iter()
        .filter(|r| r["content_hash"] == same_hash && r["duplicate_of"].is_null())
        .collect();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0]["id"], "mem:a.txt");
    assert_eq!(tally.count("c.txt"), 0, "heavy task skipped for the duplicate");
}
