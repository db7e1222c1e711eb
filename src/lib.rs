//! Concurrent forensic evidence pipeline.
//!
//! Evidence roots are enumerated into items, each item is streamed through
//! an ordered chain of processing tasks by a pool of workers, duplicates
//! are detected by content hash, and every finalized item is journaled so
//! an interrupted run can be resumed without reprocessing.

pub mod chain;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod constants;
pub mod dedup;
pub mod evidence;
pub mod item;
pub mod logging;
pub mod metadata;
pub mod pipeline;
pub mod stream;
pub mod tasks;
pub mod util;
