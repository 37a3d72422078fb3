// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::receivers::file::input::SourceId;

/// Committed offsets of one source, as last saved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedSource {
    /// Last known path, informational only. Identity is the key.
    pub path: PathBuf,
    /// Stream name to committed byte offset
    pub streams: BTreeMap<String, i64>,
}

impl PersistedSource {
    /// Smallest committed offset over all streams, the only safe resume point.
    pub fn min_offset(&self) -> Option<i64> {
        self.streams.values().copied().min()
    }
}

/// Everything the offsets file holds. Ordered maps keep the saved output
/// independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetRecord {
    pub sources: BTreeMap<SourceId, PersistedSource>,
}

impl OffsetRecord {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn get(&self, id: &SourceId) -> Option<&PersistedSource> {
        self.sources.get(id)
    }

    pub fn insert(&mut self, id: SourceId, source: PersistedSource) {
        self.sources.insert(id, source);
    }
}
