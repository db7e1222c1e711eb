//! # Dedup Cache
//!
//! Content hash → first-seen (canonical) item. Lookups and inserts are a
//! single atomic step per hash, so concurrent discoverers of the same content
//! always agree on one winner.

use std::collections::HashMap;
use std::collections::hash_map::{DefaultHasher, Entry};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::item::{ContentHash, EvidenceItem, ItemId};

const DEFAULT_SHARDS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEntry {
    pub item: ItemId,
    pub name: String,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns this hash.
    Canonical,
    Duplicate(CanonicalEntry),
}

pub struct DedupCache {
    shards: Vec<Mutex<HashMap<ContentHash, CanonicalEntry>>>,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl DedupCache {
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect();
        Self { shards }
    }

    fn shard(&self, hash: &ContentHash) -> &Mutex<HashMap<ContentHash, CanonicalEntry>> {
        let mut hasher = DefaultHasher::new();
        hash.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Registers `item` as canonical for `hash` unless another item got there first.
    ///
    /// Claiming again with the canonical item itself returns `Canonical`.
    pub fn claim(&self, hash: &ContentHash, item: &EvidenceItem) -> Claim {
        let mut shard = self.shard(hash).lock().unwrap_or_else(PoisonError::into_inner);
        match shard.entry(hash.clone()) {
            Entry::Occupied(existing) if existing.get().item == *item.id() => Claim::Canonical,
            Entry::Occupied(existing) => Claim::Duplicate(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(CanonicalEntry {
                    item: item.id().clone(),
                    name: item.name().to_string(),
                    size: item.size,
                });
                Claim::Canonical
            }
        }
    }

    /// Restores a canonical entry from a previous run. Returns false if one exists.
    pub fn seed(&self, hash: ContentHash, entry: CanonicalEntry) -> bool {
        let mut shard = self.shard(&hash).lock().unwrap_or_else(PoisonError::into_inner);
        match shard.entry(hash) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    pub fn get(&self, hash: &ContentHash) -> Option<CanonicalEntry> {
        let shard = self.shard(hash).lock().unwrap_or_else(PoisonError::into_inner);
        shard.get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
