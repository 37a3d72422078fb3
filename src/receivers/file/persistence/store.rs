// SPDX-License-Identifier: Apache-2.0

use crate::receivers::file::error::Result;
use crate::receivers::file::persistence::{OffsetFile, OffsetRecord};

/// Durable home of committed offsets.
pub trait Persister: Send + Sync {
    fn load(&self) -> Result<OffsetRecord>;

    fn save(&self, record: &OffsetRecord) -> Result<()>;
}

/// [`Persister`] backed by the on-disk offsets file.
#[derive(Debug, Clone)]
pub struct OffsetFilePersister {
    file: OffsetFile,
}

impl OffsetFilePersister {
    pub fn new(file: OffsetFile) -> Self {
        Self { file }
    }
}

impl Persister for OffsetFilePersister {
    fn load(&self) -> Result<OffsetRecord> {
        self.file.load()
    }

    fn save(&self, record: &OffsetRecord) -> Result<()> {
        self.file.save(record)
    }
}

/// In-memory persister for tests
#[cfg(test)]
#[derive(Default)]
pub struct MockPersister {
    record: parking_lot::Mutex<OffsetRecord>,
    saves: std::sync::atomic::AtomicUsize,
    fail_saves: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MockPersister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: OffsetRecord) -> Self {
        let persister = Self::default();
        *persister.record.lock() = record;
        persister
    }

    /// Last saved (or seeded) record
    pub fn record(&self) -> OffsetRecord {
        self.record.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Persister for MockPersister {
    fn load(&self) -> Result<OffsetRecord> {
        Ok(self.record())
    }

    fn save(&self, record: &OffsetRecord) -> Result<()> {
        use std::sync::atomic::Ordering;

        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("mock save failure").into());
        }
        *self.record.lock() = record.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
