//! # Pipeline Events
//!
//! Messages flowing from workers to the recorder thread, the single owner
//! of the persisted run state.

use crate::checkpoint::ItemRecord;

#[derive(Debug)]
pub enum RecorderEvent {
    /// An item reached a terminal state and was released by its worker.
    Finished(Box<ItemRecord>),
    /// Make the journal durable and rewrite the header now.
    Snapshot,
}
