//! # Evidence Items
//!
//! Identity, backing-store descriptors and the per-item status machine.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Case-unique, enumeration-stable identifier of an evidence item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex digest used as the deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new(hex_digest: impl Into<String>) -> Self {
        Self(hex_digest.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the bytes of an item physically live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backing {
    /// A plain file on the examiner's filesystem.
    File { path: PathBuf },
    /// An entry inside a container (zip archive).
    ContainerEntry {
        container: PathBuf,
        index: usize,
        entry: String,
    },
    /// A byte range carved from a larger acquisition image.
    ImageRange {
        image: PathBuf,
        offset: u64,
        length: u64,
    },
    /// Bytes held in memory, used by synthetic sources.
    Memory { key: String },
}

impl Backing {
    pub fn kind(&self) -> &'static str {
        match self {
            Backing::File { .. } => "file",
            Backing::ContainerEntry { .. } => "container_entry",
            Backing::ImageRange { .. } => "image_range",
            Backing::Memory { .. } => "memory",
        }
    }
}

/// What an evidence source yields during enumeration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceDescriptor {
    pub id: ItemId,
    pub name: String,
    pub logical_path: String,
    pub backing: Backing,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    SkippedDuplicate,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemStatus::Done | ItemStatus::Failed | ItemStatus::SkippedDuplicate
        )
    }

    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        match (self, next) {
            (ItemStatus::Pending, ItemStatus::InProgress) => true,
            // Interrupted items go back to the queue-side state.
            (ItemStatus::InProgress, ItemStatus::Pending) => true,
            (ItemStatus::InProgress, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Done => "done",
            ItemStatus::Failed => "failed",
            ItemStatus::SkippedDuplicate => "skipped_duplicate",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ItemStatus,
    pub to: ItemStatus,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid status transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// An evidence item as it moves through a worker.
#[derive(Debug, Clone)]
pub struct EvidenceItem {
    pub descriptor: EvidenceDescriptor,
    pub size: Option<u64>,
    pub content_hash: Option<ContentHash>,
    status: ItemStatus,
}

impl EvidenceItem {
    pub fn new(descriptor: EvidenceDescriptor) -> Self {
        let size = descriptor.size;
        Self {
            descriptor,
            size,
            content_hash: None,
            status: ItemStatus::Pending,
        }
    }

    pub fn id(&self) -> &ItemId {
        &self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn transition(&mut self, next: ItemStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Lower-cased extension of the logical name, without the dot.
    pub fn extension(&self) -> Option<String> {
        let name = self.descriptor.name.as_str();
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}
