use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{info, warn};

use caseflow::checkpoint::read_header;
use caseflow::evidence::CaseDescriptor;
use caseflow::pipeline::{
    Manager, ProgressConfig, ProgressReporter, ProgressSnapshot, RunOutcome,
};
use caseflow::tasks::TaskRegistry;
use caseflow::{cli, config, logging, metadata, util};

struct LogProgress;

impl ProgressReporter for LogProgress {
    fn on_progress(&self, s: &ProgressSnapshot) {
        info!(
            "progress enumerated={} pending={} in_progress={} done={} failed={} duplicates={} items_per_s={:.1} mib_per_s={:.1}",
            s.enumerated,
            s.pending,
            s.in_progress,
            s.done,
            s.failed,
            s.duplicates,
            s.items_per_second,
            s.throughput_mib
        );
    }
}

fn main() -> Result<()> {
    logging::init_logging();

    let cli_opts = cli::parse();
    util::apply_resource_limits(cli_opts.max_open_files)?;

    let registry = Arc::new(TaskRegistry::with_builtin());
    let tool_version = env!("CARGO_PKG_VERSION");
    let backend = util::backend_from_cli(cli_opts.metadata_backend);

    let interrupt_in_flight;
    let handle = if cli_opts.resume {
        let Some(state_dir) = cli_opts.state_dir.clone() else {
            bail!("--resume needs --state-dir");
        };
        let header = read_header(&state_dir)?;
        interrupt_in_flight = header.config.interrupt_in_flight;
        if let Some(path) = cli_opts.config_path.as_deref() {
            let current = config::load_config(Some(path))?;
            if current.config_hash != header.config_hash {
                warn!(
                    "config {} differs from the one the run started with; resuming with the persisted configuration",
                    path.display()
                );
            }
        }
        if !cli_opts.inputs.is_empty() {
            warn!("evidence paths are ignored on resume; the persisted case is used");
        }
        let run_output_dir = cli_opts.output.join(&header.run_id);
        util::ensure_output_dir(&run_output_dir)?;
        let sink = match backend {
            Some(kind) => metadata::build_sink(
                kind,
                tool_version,
                &header.config_hash,
                &run_output_dir,
                true,
            )?,
            None => metadata::build_dry_run_sink(),
        };
        let progress = progress_config(
            cli_opts
                .progress_interval_ms
                .unwrap_or(header.config.progress_interval_ms),
        );
        info!(
            "resuming run_id={} state_dir={} output={}",
            header.run_id,
            state_dir.display(),
            run_output_dir.display()
        );
        Manager::new(registry, sink)
            .with_progress(progress)
            .resume(&state_dir)?
    } else {
        let mut loaded = config::load_config(cli_opts.config_path.as_deref())?;
        let cfg = &mut loaded.config;
        if let Some(workers) = cli_opts.workers {
            cfg.workers = workers;
        }
        if cli_opts.expand_archives {
            cfg.expand_archives = true;
        }
        if cli_opts.no_dedup {
            cfg.dedup = false;
        }
        if cli_opts.interrupt_in_flight {
            cfg.interrupt_in_flight = true;
        }
        interrupt_in_flight = cfg.interrupt_in_flight;
        if let Some(interval) = cli_opts.progress_interval_ms {
            cfg.progress_interval_ms = interval;
        }
        if let Some(tasks) = cli_opts.tasks.as_deref() {
            for unknown in cfg.restrict_chain(tasks) {
                warn!("unknown task in --tasks: {unknown}");
            }
            if cfg.chain.is_empty() {
                bail!("no tasks left in the chain after applying --tasks");
            }
        }

        let run_output_dir = cli_opts.output.join(&cfg.run_id);
        util::ensure_output_dir(&run_output_dir)?;
        let state_dir: PathBuf = cli_opts
            .state_dir
            .clone()
            .unwrap_or_else(|| run_output_dir.join("state"));
        let sink = match backend {
            Some(kind) => metadata::build_sink(
                kind,
                tool_version,
                &loaded.config_hash,
                &run_output_dir,
                false,
            )?,
            None => metadata::build_dry_run_sink(),
        };
        let progress = progress_config(loaded.config.progress_interval_ms);
        let case = CaseDescriptor::from_paths(cli_opts.case_name.clone(), &cli_opts.inputs);
        info!(
            "starting run_id={} inputs={} output={} state_dir={}",
            loaded.config.run_id,
            cli_opts.inputs.len(),
            run_output_dir.display(),
            state_dir.display()
        );
        Manager::new(registry, sink)
            .with_progress(progress)
            .start(case, loaded, &state_dir)?
    };

    let cancel = handle.cancel_flag();
    if let Err(err) = ctrlc::set_handler(move || {
        if interrupt_in_flight {
            warn!("cancel requested; in-flight items are abandoned and stay pending for resume");
        } else {
            warn!("cancel requested; finishing in-flight items, the rest stay pending for resume");
        }
        cancel.store(true, Ordering::SeqCst);
    }) {
        warn!("failed to install Ctrl+C handler: {err}");
    }

    let state_dir = handle.state_dir().to_path_buf();
    let report = handle.wait()?;
    for failure in &report.failures {
        warn!(
            "failed item={} name={} kind={} task={} reason={}",
            failure.id,
            failure.name,
            failure.kind.as_str(),
            failure.task.as_deref().unwrap_or("-"),
            failure.reason
        );
    }
    match &report.outcome {
        RunOutcome::Completed => info!("caseflow run {} completed", report.run_id),
        RunOutcome::Cancelled => info!(
            "caseflow run {} cancelled; resume with --resume --state-dir {}",
            report.run_id,
            state_dir.display()
        ),
        RunOutcome::Paused { reason } => bail!(
            "run {} paused: {reason}; fix the cause and resume with --resume --state-dir {}",
            report.run_id,
            state_dir.display()
        ),
    }
    Ok(())
}

fn progress_config(interval_ms: u64) -> ProgressConfig {
    ProgressConfig {
        reporter: Arc::new(LogProgress),
        interval: Duration::from_millis(interval_ms.max(1)),
    }
}
