// SPDX-License-Identifier: Apache-2.0

//! Worker lanes: pull jobs off the work channel, read new bytes, split them
//! into records and hand each one to the sink.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, trace};

use crate::bounded_channel::{BoundedReceiver, BoundedSender, TrySendError};
use crate::receivers::file::error::{Error, Result};
use crate::receivers::file::job::{Job, ReadProgress, Release, WorkItem};
use crate::receivers::file::registry::JobRegistry;
use crate::receivers::file::sink::{RecordRef, RecordSink};
use crate::receivers::file::supervisor::Supervisor;

const TERMINATOR: u8 = b'\n';

/// Sizes that shape a read pass.
#[derive(Debug, Clone, Copy)]
pub struct ReadLimits {
    pub read_buffer_size: usize,
    pub max_record_size: usize,
}

/// Per-lane scratch space, never shared between lanes.
pub(crate) struct LaneReader {
    buf: Vec<u8>,
    /// Unterminated bytes carried across reads, capped at `max_record_size`.
    carry: Vec<u8>,
    /// Full length of the unterminated run, including bytes past the cap.
    carry_len: u64,
    max_record_size: usize,
}

impl LaneReader {
    pub(crate) fn new(limits: ReadLimits) -> Self {
        Self {
            buf: vec![0; limits.read_buffer_size.max(1)],
            carry: Vec::new(),
            carry_len: 0,
            max_record_size: limits.max_record_size.max(1),
        }
    }

    /// One read pass over `file`, starting at its current cursor.
    ///
    /// Reads until a chunk holds at least one terminator or the file ends.
    /// Every terminated record is pushed, then the cursor is left right after
    /// the last terminator so an unterminated tail is read again next pass.
    pub(crate) fn read_pass(
        &mut self,
        job: &Job,
        file: &mut File,
        registry: &JobRegistry,
        sink: &dyn RecordSink,
    ) -> Result<ReadProgress> {
        let source_id = job.source_id();
        let start = file.stream_position().map_err(|e| self.io_err(registry, job, e))?;

        self.carry.clear();
        self.carry_len = 0;
        let mut consumed: u64 = 0;
        let mut read_total: u64 = 0;
        let mut emitted = false;
        let mut hit_eof = false;

        loop {
            let n = match file.read(&mut self.buf) {
                Ok(0) => {
                    hit_eof = true;
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_err(registry, job, e)),
            };
            read_total += n as u64;

            let mut line_start = 0;
            while let Some(pos) = memchr(TERMINATOR, &self.buf[line_start..n]) {
                let line_end = line_start + pos;
                let piece = &self.buf[line_start..line_end];
                consumed += self.carry_len + piece.len() as u64 + 1;

                let record = RecordRef {
                    source_id,
                    offset: start,
                    len: consumed,
                    bytes: if self.carry_len == 0 {
                        &piece[..piece.len().min(self.max_record_size)]
                    } else {
                        let room = self.max_record_size.saturating_sub(self.carry.len());
                        self.carry.extend_from_slice(&piece[..piece.len().min(room)]);
                        &self.carry
                    },
                };
                registry
                    .metrics()
                    .record_read(self.carry_len + piece.len() as u64 + 1);
                sink.push(record)?;

                self.carry.clear();
                self.carry_len = 0;
                line_start = line_end + 1;
                emitted = true;
            }

            let tail = &self.buf[line_start..n];
            let room = self.max_record_size.saturating_sub(self.carry.len());
            self.carry.extend_from_slice(&tail[..tail.len().min(room)]);
            self.carry_len += tail.len() as u64;

            if emitted {
                break;
            }
        }

        let position = start + consumed;
        if read_total > consumed {
            file.seek(SeekFrom::Start(position))
                .map_err(|e| self.io_err(registry, job, e))?;
        }

        let size = file
            .metadata()
            .map_err(|e| self.io_err(registry, job, e))?
            .len();
        let observed_end = start + read_total;

        if hit_eof && size < observed_end {
            registry.reset_job(job, file)?;
            return Ok(ReadProgress {
                hit_eof: false,
                position: 0,
                observed_end: 0,
                size,
            });
        }

        trace!(source_id = %source_id, start, position, size, hit_eof, "Read pass finished");
        Ok(ReadProgress {
            hit_eof,
            position,
            observed_end,
            size,
        })
    }

    fn io_err(&self, registry: &JobRegistry, job: &Job, e: io::Error) -> Error {
        Error::file_io(registry.path_of(job.source_id()).unwrap_or_default(), e)
    }
}

fn memchr(needle: u8, haystack: &[u8]) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

/// Fixed set of reader threads.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `lanes` reader threads fed by `rx`.
    pub fn start(
        lanes: usize,
        rx: BoundedReceiver<WorkItem>,
        registry: Arc<JobRegistry>,
        sink: Arc<dyn RecordSink>,
        supervisor: Arc<Supervisor>,
        limits: ReadLimits,
    ) -> Result<Self> {
        let mut handles = Vec::with_capacity(lanes);
        for lane in 0..lanes {
            let worker = Worker {
                lane,
                rx: rx.clone(),
                tx: registry.work_sender(),
                registry: registry.clone(),
                sink: sink.clone(),
                supervisor: supervisor.clone(),
                reader: LaneReader::new(limits),
            };
            let handle = std::thread::Builder::new()
                .name(format!("logtrail-worker-{}", lane))
                .spawn(move || worker.run())?;
            handles.push(handle);
        }
        debug!(lanes, "Started worker pool");
        Ok(Self { handles })
    }

    pub fn lanes(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every lane to exit. Lanes exit on a `Shutdown` item, when the
    /// channel closes, or after a fatal error.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

struct Worker {
    lane: usize,
    rx: BoundedReceiver<WorkItem>,
    tx: BoundedSender<WorkItem>,
    registry: Arc<JobRegistry>,
    sink: Arc<dyn RecordSink>,
    supervisor: Arc<Supervisor>,
    reader: LaneReader,
}

impl Worker {
    fn run(mut self) {
        trace!(lane = self.lane, "Worker started");
        while let Some(item) = self.rx.recv_blocking() {
            let job = match item {
                WorkItem::Shutdown => break,
                WorkItem::Job(job) => job,
            };
            if self.registry.is_shutting_down() {
                continue;
            }
            if let Err(e) = self.process(&job) {
                let fatal = e.is_fatal();
                self.supervisor
                    .report(&format!("Worker failed on source {}", job.source_id()), e);
                if fatal {
                    break;
                }
            }
        }
        trace!(lane = self.lane, "Worker stopped");
    }

    /// Read `job` until it is done or handed back to the channel. When the
    /// channel is full the lane keeps the job rather than block on a channel
    /// only lanes drain.
    fn process(&mut self, job: &Arc<Job>) -> Result<()> {
        loop {
            let Some(mut file) = self.registry.claim_job(job)? else {
                return Ok(());
            };
            let progress =
                self.reader
                    .read_pass(job, &mut file, &self.registry, self.sink.as_ref())?;

            match self.registry.release_job(job, file, progress)? {
                Release::Done => return Ok(()),
                Release::Requeue => {
                    if self.registry.is_shutting_down() {
                        return Ok(());
                    }
                    if requeue(&self.tx, job)? {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Hand `job` back to the channel. `Ok(false)` means the channel is full and
/// the caller keeps the job.
fn requeue(tx: &BoundedSender<WorkItem>, job: &Arc<Job>) -> Result<bool> {
    match tx.try_send(WorkItem::Job(job.clone())) {
        Ok(()) => Ok(true),
        Err(TrySendError::Full(_)) => Ok(false),
        Err(TrySendError::Disconnected(_)) => Err(Error::ChannelSend),
    }
}
