// SPDX-License-Identifier: Apache-2.0

//! Downstream side of the worker pool.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::receivers::file::error::{Error, Result};
use crate::receivers::file::input::SourceId;
use crate::receivers::file::registry::JobRegistry;

/// Stream used when a file carries a single logical stream.
pub const DEFAULT_STREAM: &str = "default";

/// One record as seen by a sink.
///
/// `bytes` borrows the worker's read buffer and is only valid for the
/// duration of [`RecordSink::push`]. Copy it to keep it.
#[derive(Debug, Clone, Copy)]
pub struct RecordRef<'a> {
    pub source_id: SourceId,
    /// File offset at which the read pass producing this record started.
    pub offset: u64,
    /// Bytes consumed since `offset` up to and including this record's
    /// terminator. `offset + len` is what to commit once handed off.
    pub len: u64,
    /// Record content without the terminator, possibly truncated.
    pub bytes: &'a [u8],
}

impl<'a> RecordRef<'a> {
    /// Offset just past this record's terminator.
    pub fn end_offset(&self) -> i64 {
        (self.offset + self.len) as i64
    }

    /// Borrowed string view over the record, valid as long as the record is.
    pub fn as_str(&self) -> std::result::Result<&'a str, std::str::Utf8Error> {
        std::str::from_utf8(self.bytes)
    }
}

/// Receives every terminated record, in file order per source.
///
/// Records are pushed from worker threads. The sink must call
/// [`JobRegistry::commit`] once a record is handed off; that may happen later
/// and from another thread. An error stops the receiver.
pub trait RecordSink: Send + Sync {
    fn push(&self, record: RecordRef<'_>) -> Result<()>;
}

/// Writes each record as a line and commits it right away.
///
/// Records at or below the committed offset were already delivered before a
/// restart and are dropped.
pub struct WriterSink<W: Write + Send> {
    writer: Mutex<W>,
    registry: Arc<JobRegistry>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W, registry: Arc<JobRegistry>) -> Self {
        Self {
            writer: Mutex::new(writer),
            registry,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> RecordSink for WriterSink<W> {
    fn push(&self, record: RecordRef<'_>) -> Result<()> {
        let end = record.end_offset();
        if self
            .registry
            .already_committed(record.source_id, DEFAULT_STREAM, end)
        {
            trace!(source_id = %record.source_id, end, "Skipping replayed record");
            return Ok(());
        }

        {
            let mut writer = self.writer.lock();
            writer
                .write_all(record.bytes)
                .and_then(|_| writer.write_all(b"\n"))
                .and_then(|_| writer.flush())
                .map_err(|e| Error::Sink(format!("write failed: {}", e)))?;
        }
        self.registry.commit(record.source_id, DEFAULT_STREAM, end)
    }
}
