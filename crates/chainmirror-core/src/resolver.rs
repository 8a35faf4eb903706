//! Chain status resolver: decides a block's status against a best-chain snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::ChainStatus;

/// One `(height, hash)` pair of the node's best chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestChainEntry {
    pub height: u64,
    pub hash: String,
}

/// The node's current view of the trailing window of its best chain:
/// exactly one canonical hash per height, ordered by height.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestChain {
    blocks: BTreeMap<u64, String>,
}

impl BestChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from entries; a later entry for the same height wins.
    pub fn from_entries(entries: impl IntoIterator<Item = BestChainEntry>) -> Self {
        entries
            .into_iter()
            .map(|e| (e.height, e.hash))
            .collect()
    }

    pub fn insert(&mut self, height: u64, hash: impl Into<String>) {
        self.blocks.insert(height, hash.into());
    }

    /// Status of the block `(height, hash)` under this snapshot.
    ///
    /// - height outside the snapshot → [`ChainStatus::Pending`]
    /// - same hash as the snapshot → [`ChainStatus::Canonical`]
    /// - different hash → [`ChainStatus::Orphaned`]
    pub fn resolve(&self, height: u64, hash: &str) -> ChainStatus {
        match self.blocks.get(&height) {
            None => ChainStatus::Pending,
            Some(canonical) if canonical == hash => ChainStatus::Canonical,
            Some(_) => ChainStatus::Orphaned,
        }
    }

    /// Canonical hash at `height`, if the height is inside the window.
    pub fn canonical_hash(&self, height: u64) -> Option<&str> {
        self.blocks.get(&height).map(String::as_str)
    }

    /// Iterate `(height, canonical hash)` from the oldest height to the tip.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> {
        self.blocks.iter().map(|(h, hash)| (*h, hash.as_str()))
    }

    /// Highest height in the snapshot.
    pub fn tip(&self) -> Option<u64> {
        self.blocks.keys().next_back().copied()
    }

    /// Lowest height in the snapshot.
    pub fn floor(&self) -> Option<u64> {
        self.blocks.keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl FromIterator<(u64, String)> for BestChain {
    fn from_iter<T: IntoIterator<Item = (u64, String)>>(iter: T) -> Self {
        Self {
            blocks: iter.into_iter().collect(),
        }
    }
}
