// SPDX-License-Identifier: Apache-2.0

//! Tailing state of one physical file.

use std::collections::BTreeMap;
use std::fs::File;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::receivers::file::error::{Error, Result};
use crate::receivers::file::input::SourceId;

/// Item carried by the work channel.
pub enum WorkItem {
    Job(Arc<Job>),
    /// One per worker lane, pushed on shutdown.
    Shutdown,
}

/// Mutable part of a [`Job`], only touched under the job lock.
#[derive(Debug)]
pub(crate) struct JobState {
    /// `None` while a worker holds the handle and after removal.
    pub(crate) file: Option<File>,
    pub(crate) is_done: bool,
    pub(crate) is_running: bool,
    /// A resume arrived while running.
    pub(crate) rescan: bool,
    pub(crate) removed: bool,
    pub(crate) offsets: BTreeMap<String, i64>,
    pub(crate) latest_size: u64,
    /// Cursor of the handle as of the last release.
    pub(crate) position: u64,
}

/// A tracked file, keyed by its [`SourceId`].
///
/// State machine: `Done -> Queued -> Running -> Done`, with `Running -> Queued`
/// when a pass stops before the end of the file. A job is never done and
/// running at the same time, and only the worker that claimed it touches the
/// file handle.
#[derive(Debug)]
pub struct Job {
    source_id: SourceId,
    state: Mutex<JobState>,
}

impl Job {
    /// New jobs start done, so the first resume enqueues them.
    pub(crate) fn new(
        source_id: SourceId,
        file: File,
        position: u64,
        offsets: BTreeMap<String, i64>,
    ) -> Self {
        Self {
            source_id,
            state: Mutex::new(JobState {
                file: Some(file),
                is_done: true,
                is_running: false,
                rescan: false,
                removed: false,
                offsets,
                latest_size: 0,
                position,
            }),
        }
    }

    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().is_done
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_running
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    /// Snapshot of committed offsets per stream.
    pub fn offsets(&self) -> BTreeMap<String, i64> {
        self.state.lock().offsets.clone()
    }

    pub fn offset(&self, stream: &str) -> Option<i64> {
        self.state.lock().offsets.get(stream).copied()
    }

    pub fn latest_size(&self) -> u64 {
        self.state.lock().latest_size
    }

    /// Read cursor as of the last release (or the initial seek).
    pub fn position(&self) -> u64 {
        self.state.lock().position
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock()
    }
}

/// Where a finished read pass left the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadProgress {
    pub hit_eof: bool,
    /// Cursor after the last emitted terminator.
    pub position: u64,
    /// Bytes present when EOF was observed, including an unterminated tail.
    pub observed_end: u64,
    /// File size at the end of the pass.
    pub size: u64,
}

impl ReadProgress {
    pub fn caught_up(&self) -> bool {
        self.hit_eof && self.observed_end >= self.size
    }
}

/// Outcome of releasing a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Done,
    /// More bytes may be available; the job must go back on the channel.
    Requeue,
}

#[derive(Debug, Default)]
struct Counts {
    total: i64,
    done: i64,
}

/// Counts tracked and done jobs, and lets callers wait until every job is
/// done. Any count going out of range means the bookkeeping is corrupt.
#[derive(Debug, Default)]
pub struct DoneTracker {
    counts: Mutex<Counts>,
    drained: Condvar,
}

impl DoneTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> i64 {
        self.counts.lock().total
    }

    pub fn done(&self) -> i64 {
        self.counts.lock().done
    }

    pub(crate) fn add_job(&self, done: bool) -> Result<()> {
        let mut counts = self.counts.lock();
        counts.total += 1;
        if done {
            counts.done += 1;
        }
        self.check_and_notify(&counts)
    }

    pub(crate) fn remove_job(&self, was_done: bool) -> Result<()> {
        let mut counts = self.counts.lock();
        counts.total -= 1;
        if was_done {
            counts.done -= 1;
        }
        self.check_and_notify(&counts)
    }

    pub(crate) fn mark_done(&self) -> Result<()> {
        let mut counts = self.counts.lock();
        counts.done += 1;
        self.check_and_notify(&counts)
    }

    pub(crate) fn mark_not_done(&self) -> Result<()> {
        let mut counts = self.counts.lock();
        counts.done -= 1;
        self.check_and_notify(&counts)
    }

    fn check_and_notify(&self, counts: &Counts) -> Result<()> {
        if counts.total < 0 || counts.done < 0 || counts.done > counts.total {
            return Err(Error::invariant(format!(
                "done jobs counter out of range: done={} total={}",
                counts.done, counts.total
            )));
        }
        if counts.done == counts.total {
            self.drained.notify_all();
        }
        Ok(())
    }

    /// Block until every tracked job is done, or `timeout` passes.
    pub fn wait_until_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut counts = self.counts.lock();
        while counts.done != counts.total {
            if self.drained.wait_until(&mut counts, deadline).timed_out() {
                return counts.done == counts.total;
            }
        }
        true
    }
}
