use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::evidence::ResolverLimits;

/// Options passed verbatim to a task factory.
pub type TaskOptions = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TaskSpec {
    pub id: String,
    #[serde(default)]
    pub options: TaskOptions,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            options: TaskOptions::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub run_id: String,
    /// Zero selects the available parallelism.
    #[serde(default)]
    pub workers: usize,
    /// Zero derives the work queue capacity from the worker count.
    #[serde(default)]
    pub queue_capacity: usize,
    /// Finalized items between RunState header snapshots.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Per-item deadline honoured at task checkpoints; zero disables it.
    #[serde(default)]
    pub item_timeout_secs: u64,
    /// Lets task checkpoints abandon in-flight items on cancel; they stay
    /// pending for resume. Off means in-flight items run to a terminal state.
    #[serde(default)]
    pub interrupt_in_flight: bool,
    #[serde(default = "default_container_memory_limit")]
    pub container_memory_limit: u64,
    #[serde(default)]
    pub max_container_entry_bytes: Option<u64>,
    #[serde(default = "default_max_open_containers")]
    pub max_open_containers: usize,
    #[serde(default)]
    pub expand_archives: bool,
    #[serde(default = "default_true")]
    pub dedup: bool,
    pub chain: Vec<TaskSpec>,
}

fn default_checkpoint_interval() -> u64 {
    256
}

fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_container_memory_limit() -> u64 {
    16 * crate::constants::MIB
}

fn default_max_open_containers() -> usize {
    32
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            run_id: String::new(),
            workers: 0,
            queue_capacity: 0,
            checkpoint_interval: default_checkpoint_interval(),
            progress_interval_ms: default_progress_interval_ms(),
            item_timeout_secs: 0,
            interrupt_in_flight: false,
            container_memory_limit: default_container_memory_limit(),
            max_container_entry_bytes: None,
            max_open_containers: default_max_open_containers(),
            expand_archives: false,
            dedup: true,
            chain: Vec::new(),
        }
    }
}

impl Config {
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }

    pub fn resolver_limits(&self) -> ResolverLimits {
        ResolverLimits {
            container_memory_limit: self.container_memory_limit,
            max_container_entry_bytes: self.max_container_entry_bytes,
            max_open_containers: self.max_open_containers,
        }
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.chain.iter().map(|t| t.id.clone()).collect()
    }

    /// Keeps only the listed tasks, preserving configured order.
    ///
    /// Returns the requested ids that are not part of the chain.
    pub fn restrict_chain(&mut self, ids: &[String]) -> Vec<String> {
        let unknown = ids
            .iter()
            .filter(|id| !self.chain.iter().any(|t| &t.id == *id))
            .cloned()
            .collect();
        self.chain.retain(|t| ids.contains(&t.id));
        unknown
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub config_hash: String,
}

impl LoadedConfig {
    /// Wraps an in-memory config, hashing its canonical serialization.
    pub fn from_config(config: Config) -> Result<Self> {
        let bytes = serde_json::to_vec(&config).context("serialize config")?;
        Ok(Self {
            config_hash: hash_bytes(&bytes),
            config,
        })
    }
}

pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let bytes: Vec<u8> = if let Some(p) = path {
        std::fs::read(p).with_context(|| format!("read config {}", p.display()))?
    } else {
        include_bytes!("../config/default.yml").to_vec()
    };

    let mut config: Config = serde_yaml::from_slice(&bytes).context("parse config")?;
    if config.run_id.trim().is_empty() {
        config.run_id = generate_run_id();
    }

    let config_hash = hash_bytes(&bytes);

    Ok(LoadedConfig {
        config,
        config_hash,
    })
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(digest)
}

pub(crate) fn generate_run_id() -> String {
    let now = chrono::Utc::now();
    format!("{}_{}", now.format("%Y%m%dT%H%M%SZ"), rand_suffix())
}

fn rand_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{:08x}", nanos)
}
