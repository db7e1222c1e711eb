use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataBackend {
    Jsonl,
    Csv,
    Sqlite,
    DryRun,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliOptions {
    /// Evidence roots: directories, zip archives, raw images or single files
    #[arg(required_unless_present = "resume")]
    pub inputs: Vec<PathBuf>,

    /// Case name recorded in the run state and summaries
    #[arg(long, default_value = "case")]
    pub case_name: String,

    /// Output directory for metadata
    #[arg(short, long, default_value = "./output")]
    pub output: PathBuf,

    /// Optional path to config file (YAML)
    #[arg(long)]
    pub config_path: Option<PathBuf>,

    /// Directory holding the run state (defaults to <output>/<run_id>/state)
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Resume the run whose state lives in --state-dir
    #[arg(long, requires = "state_dir")]
    pub resume: bool,

    /// Number of worker threads (overrides config; 0 = all cores)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Metadata backend
    #[arg(long, value_enum, default_value_t = MetadataBackend::Jsonl)]
    pub metadata_backend: MetadataBackend,

    /// Restrict the configured chain to these task ids (comma-separated list)
    #[arg(long, value_delimiter = ',')]
    pub tasks: Option<Vec<String>>,

    /// Enumerate entries of zip archives found under directory roots
    #[arg(long)]
    pub expand_archives: bool,

    /// Disable content deduplication
    #[arg(long)]
    pub no_dedup: bool,

    /// On Ctrl+C, abandon in-flight items at the next task checkpoint
    #[arg(long)]
    pub interrupt_in_flight: bool,

    /// Raise or lower the soft limit on open file descriptors
    #[arg(long)]
    pub max_open_files: Option<u64>,

    /// Print a progress line every N milliseconds (overrides config)
    #[arg(long)]
    pub progress_interval_ms: Option<u64>,
}

pub fn parse() -> CliOptions {
    CliOptions::parse()
}
