pub const MIB: u64 = 1024 * 1024;

/// Work queue capacity per worker when the config leaves it at zero.
pub const CHANNEL_CAPACITY_MULTIPLIER: usize = 4;
pub const MIN_CHANNEL_CAPACITY: usize = 16;

/// How long blocked queue operations wait before re-checking the cancel flag.
pub const QUEUE_POLL_INTERVAL_MS: u64 = 50;

/// Read buffer used by content-reading tasks.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Consecutive zero-byte reads tolerated before a stream is considered stuck.
pub const MAX_EMPTY_READS: u32 = 16;

pub const STATE_FILE_NAME: &str = "run_state.json";
pub const JOURNAL_FILE_NAME: &str = "items.jsonl";
pub const STATE_FORMAT_VERSION: u32 = 1;
