// SPDX-License-Identifier: Apache-2.0

//! Registry of tracked files.
//!
//! Maps each [`SourceId`] to its [`Job`] and to the path it was last seen at,
//! and owns every state transition of a job: discovery, resume, claim,
//! release, reset, commit and removal.
//!
//! Lock order: the registry lock may be taken before a job lock, never the
//! other way around, and neither is held across file I/O except a short
//! `fstat` on an idle job during maintenance.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::bounded_channel::{BoundedSender, TrySendError};
use crate::receivers::file::config::{FileReceiverConfig, PersistenceMode};
use crate::receivers::file::error::{Error, Result};
use crate::receivers::file::input::{SourceId, get_path_from_file};
use crate::receivers::file::job::{DoneTracker, Job, ReadProgress, Release, WorkItem};
use crate::receivers::file::metrics::ReceiverMetrics;
use crate::receivers::file::persistence::{
    OffsetRecord, PersistedSource, Persister, is_valid_stream_name,
};

const ENQUEUE_RETRY: Duration = Duration::from_millis(100);

#[derive(Default)]
struct JobMaps {
    jobs: HashMap<SourceId, Arc<Job>>,
    paths: HashMap<SourceId, PathBuf>,
}

/// What one maintenance sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceStats {
    pub resumed: usize,
    pub renamed: usize,
    pub removed: usize,
}

enum PathCheck {
    Unchanged,
    Moved(PathBuf),
    Gone,
}

/// Shared registry of jobs. One per receiver, handed around in an `Arc`.
pub struct JobRegistry {
    maps: Mutex<JobMaps>,
    loaded: Mutex<OffsetRecord>,
    work_tx: BoundedSender<WorkItem>,
    persister: Arc<dyn Persister>,
    persistence_mode: PersistenceMode,
    offsets_path: PathBuf,
    offsets_tmp_path: PathBuf,
    done: DoneTracker,
    dirty: AtomicBool,
    save_lock: Mutex<()>,
    shutting_down: AtomicBool,
    discovered: AtomicU64,
    metrics: ReceiverMetrics,
}

impl JobRegistry {
    pub fn new(
        config: &FileReceiverConfig,
        work_tx: BoundedSender<WorkItem>,
        persister: Arc<dyn Persister>,
    ) -> Self {
        Self {
            maps: Mutex::new(JobMaps::default()),
            loaded: Mutex::new(OffsetRecord::default()),
            work_tx,
            persister,
            persistence_mode: config.persistence_mode,
            offsets_path: config.offsets_path.clone(),
            offsets_tmp_path: config.offsets_tmp_path(),
            done: DoneTracker::new(),
            dirty: AtomicBool::new(false),
            save_lock: Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            discovered: AtomicU64::new(0),
            metrics: ReceiverMetrics::new(),
        }
    }

    pub fn job(&self, id: SourceId) -> Option<Arc<Job>> {
        self.maps.lock().jobs.get(&id).cloned()
    }

    pub fn path_of(&self, id: SourceId) -> Option<PathBuf> {
        self.maps.lock().paths.get(&id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.maps.lock().jobs.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn done_tracker(&self) -> &DoneTracker {
        &self.done
    }

    pub(crate) fn metrics(&self) -> &ReceiverMetrics {
        &self.metrics
    }

    pub(crate) fn work_sender(&self) -> BoundedSender<WorkItem> {
        self.work_tx.clone()
    }

    /// Block until every tracked job is done, or `timeout` passes.
    pub fn wait_until_drained(&self, timeout: Duration) -> bool {
        self.done.wait_until_drained(timeout)
    }

    /// Stop handing out work. Queued jobs are left unread.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Count a file reported as created.
    pub fn note_discovered(&self) {
        self.discovered.fetch_add(1, Ordering::Relaxed);
        self.metrics.file_discovered();
    }

    pub fn files_discovered(&self) -> u64 {
        self.discovered.load(Ordering::Relaxed)
    }

    /// Read the offsets file into memory. Must finish before the first job is
    /// created for persisted offsets to be honored.
    pub fn load_offsets(&self) -> Result<usize> {
        let record = self.persister.load()?;
        let count = record.len();
        info!(path = ?self.offsets_path, sources = count, "Loaded persisted offsets");
        *self.loaded.lock() = record;
        Ok(count)
    }

    /// Persist committed offsets of every tracked job.
    pub fn save_offsets(&self) -> Result<()> {
        let _saving = self.save_lock.lock();
        // cleared first so a commit racing with this save marks it dirty again
        self.dirty.store(false, Ordering::SeqCst);

        let snapshot: Vec<(SourceId, PathBuf, Arc<Job>)> = {
            let maps = self.maps.lock();
            maps.jobs
                .iter()
                .filter_map(|(id, job)| {
                    maps.paths
                        .get(id)
                        .map(|path| (*id, path.clone(), job.clone()))
                })
                .collect()
        };

        let mut record = OffsetRecord::default();
        for (id, path, job) in snapshot {
            let streams = job.offsets();
            if streams.is_empty() {
                continue;
            }
            record.insert(id, PersistedSource { path, streams });
        }

        if let Err(e) = self.persister.save(&record) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        debug!(sources = record.len(), "Saved offsets");
        Ok(())
    }

    fn is_offsets_file(&self, path: &Path) -> bool {
        if path == self.offsets_path || path == self.offsets_tmp_path {
            return true;
        }
        let (Some(name), Some(parent)) = (path.file_name(), path.parent()) else {
            return false;
        };
        let same_name = Some(name) == self.offsets_path.file_name()
            || Some(name) == self.offsets_tmp_path.file_name();
        if !same_name {
            return false;
        }
        match (
            fs::canonicalize(parent),
            self.offsets_path.parent().map(fs::canonicalize),
        ) {
            (Ok(a), Some(Ok(b))) => a == b,
            _ => false,
        }
    }

    /// Start tailing `path`, or resume it if its identity is already tracked.
    ///
    /// A file that vanished before it could be examined is skipped. Finding the
    /// offsets file, or any other stat or open failure, is fatal.
    pub fn add_or_resume_job(&self, path: &Path, load_persisted: bool) -> Result<()> {
        if self.is_offsets_file(path) {
            return Err(Error::invariant(format!(
                "offsets file {:?} is inside the watched directory",
                path
            )));
        }

        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = ?path, "File vanished before it could be tracked");
                return Ok(());
            }
            Err(e) => return Err(Error::file_io(path, e)),
        };
        if !metadata.is_file() {
            trace!(path = ?path, "Skipping non-regular file");
            return Ok(());
        }

        let id = match SourceId::identify(path, &metadata) {
            Ok(id) => id,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::file_io(path, e)),
        };

        if let Some(job) = self.track_path(id, path) {
            return self.resume_job(&job);
        }

        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = ?path, "File vanished before it could be opened");
                return Ok(());
            }
            Err(e) => return Err(Error::file_io(path, e)),
        };
        let opened_id = SourceId::from_file(&file).map_err(|e| Error::file_io(path, e))?;
        if opened_id != id {
            // replaced between stat and open, go with what we actually hold
            debug!(path = ?path, stat_id = %id, opened_id = %opened_id, "File replaced during discovery");
            if let Some(job) = self.track_path(opened_id, path) {
                return self.resume_job(&job);
            }
        }
        let id = opened_id;

        let (position, offsets) = if load_persisted {
            self.initial_position(id, &file, path)?
        } else {
            (0, BTreeMap::new())
        };
        if position > 0 {
            file.seek(SeekFrom::Start(position))
                .map_err(|e| Error::file_io(path, e))?;
        }

        let job = {
            let mut maps = self.maps.lock();
            if let Some(existing) = maps.jobs.get(&id).cloned() {
                // lost a discovery race, our handle is dropped
                maps.paths.insert(id, path.to_path_buf());
                existing
            } else {
                let job = Arc::new(Job::new(id, file, position, offsets));
                maps.jobs.insert(id, job.clone());
                maps.paths.insert(id, path.to_path_buf());
                self.done.add_job(true)?;
                info!(source_id = %id, path = ?path, position, "Started tracking file");
                job
            }
        };

        self.resume_job(&job)
    }

    /// Existing job for `id`, with its path updated to `path`.
    fn track_path(&self, id: SourceId, path: &Path) -> Option<Arc<Job>> {
        let mut maps = self.maps.lock();
        let job = maps.jobs.get(&id).cloned()?;
        if maps.paths.get(&id).map(PathBuf::as_path) != Some(path) {
            let previous = maps.paths.insert(id, path.to_path_buf());
            info!(source_id = %id, from = ?previous, to = ?path, "Tracked file moved");
        }
        Some(job)
    }

    /// Resume point and seeded offsets for a newly opened file. Resuming at the
    /// smallest stream offset re-delivers rather than skips for every stream.
    fn initial_position(
        &self,
        id: SourceId,
        file: &File,
        path: &Path,
    ) -> Result<(u64, BTreeMap<String, i64>)> {
        let Some(persisted) = self.loaded.lock().get(&id).cloned() else {
            return Ok((0, BTreeMap::new()));
        };
        let Some(min) = persisted.min_offset() else {
            return Ok((0, BTreeMap::new()));
        };
        if min < 0 {
            return Err(Error::invariant(format!(
                "negative persisted offset {} for source {}",
                min, id
            )));
        }

        let size = file.metadata().map_err(|e| Error::file_io(path, e))?.len();
        if min as u64 > size {
            warn!(
                source_id = %id,
                path = ?path,
                offset = min,
                size,
                "Persisted offset beyond end of file, reading from the start"
            );
            return Ok((0, BTreeMap::new()));
        }
        if persisted.path != path {
            debug!(source_id = %id, persisted = ?persisted.path, path = ?path, "File moved since offsets were saved");
        }
        Ok((min as u64, persisted.streams))
    }

    /// Make a job eligible for reading.
    ///
    /// Done jobs go back on the work channel, blocking while it is full.
    /// Running jobs are flagged to be read again after release. Jobs already
    /// queued are left alone, so repeated resumes enqueue at most once.
    pub fn resume_job(&self, job: &Arc<Job>) -> Result<()> {
        let enqueue = {
            let mut state = job.lock();
            if state.removed {
                false
            } else if state.is_running {
                state.rescan = true;
                false
            } else if state.is_done {
                state.is_done = false;
                self.done.mark_not_done()?;
                true
            } else {
                false
            }
        };
        if !enqueue {
            return Ok(());
        }

        trace!(source_id = %job.source_id(), "Resuming job");
        let mut item = WorkItem::Job(job.clone());
        loop {
            if self.is_shutting_down() {
                return Ok(());
            }
            match self.work_tx.send_timeout(item, ENQUEUE_RETRY) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => item = back,
                Err(TrySendError::Disconnected(_)) => return Err(Error::ChannelSend),
            }
        }
    }

    /// Worker side: take exclusive ownership of the file handle.
    /// `None` means the job was removed while queued.
    pub fn claim_job(&self, job: &Job) -> Result<Option<File>> {
        let mut state = job.lock();
        if state.removed {
            return Ok(None);
        }
        if state.is_running || state.is_done {
            return Err(Error::invariant(format!(
                "claimed job {} in state running={} done={}",
                job.source_id(),
                state.is_running,
                state.is_done
            )));
        }
        let Some(file) = state.file.take() else {
            return Err(Error::invariant(format!(
                "job {} has no file handle",
                job.source_id()
            )));
        };
        state.is_running = true;
        Ok(Some(file))
    }

    /// Worker side: hand the file back after a read pass.
    pub fn release_job(&self, job: &Job, file: File, progress: ReadProgress) -> Result<Release> {
        let mut state = job.lock();
        if !state.is_running {
            return Err(Error::invariant(format!(
                "released job {} that was not running",
                job.source_id()
            )));
        }
        state.is_running = false;
        state.file = Some(file);
        state.position = progress.position;
        state.latest_size = progress.size;

        if progress.caught_up() && !state.rescan {
            state.is_done = true;
            drop(state);
            self.done.mark_done()?;
            trace!(source_id = %job.source_id(), position = progress.position, "Job done");
            return Ok(Release::Done);
        }
        state.rescan = false;
        Ok(Release::Requeue)
    }

    /// The file shrank below what was already read: start over from zero.
    pub fn reset_job(&self, job: &Job, file: &mut File) -> Result<()> {
        file.seek(SeekFrom::Start(0))
            .map_err(|e| Error::file_io(self.path_of(job.source_id()).unwrap_or_default(), e))?;

        let mut state = job.lock();
        for offset in state.offsets.values_mut() {
            *offset = 0;
        }
        state.latest_size = 0;
        state.position = 0;
        drop(state);

        warn!(source_id = %job.source_id(), "File truncated, reading again from the start");
        Ok(())
    }

    /// Record that everything before `offset` in `stream` was handed off.
    /// Offsets must strictly increase per stream.
    pub fn commit(&self, id: SourceId, stream: &str, offset: i64) -> Result<()> {
        if !is_valid_stream_name(stream) {
            return Err(Error::invariant(format!(
                "stream name {:?} for source {} cannot be persisted",
                stream, id
            )));
        }
        let Some(job) = self.job(id) else {
            warn!(source_id = %id, stream, offset, "Commit for untracked source ignored");
            return Ok(());
        };

        {
            let mut state = job.lock();
            match state.offsets.get(stream) {
                Some(&current) if offset <= current => {
                    return Err(Error::invariant(format!(
                        "commit offset {} for source {} stream {:?} does not exceed {}",
                        offset, id, stream, current
                    )));
                }
                _ => {
                    state.offsets.insert(stream.to_string(), offset);
                }
            }
        }
        self.dirty.store(true, Ordering::SeqCst);

        if self.persistence_mode == PersistenceMode::Sync {
            self.save_offsets()?;
        }
        Ok(())
    }

    /// Whether `offset` is already covered for `stream`. Records re-read after
    /// resuming at the smallest stream offset are skipped this way.
    pub fn already_committed(&self, id: SourceId, stream: &str, offset: i64) -> bool {
        self.job(id)
            .and_then(|job| job.offset(stream))
            .is_some_and(|current| offset <= current)
    }

    /// Discover every regular file directly under `dir`.
    pub fn scan_directory(&self, dir: &Path, load_persisted: bool) -> Result<usize> {
        let entries = fs::read_dir(dir).map_err(|e| Error::file_io(dir, e))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::file_io(dir, e))?;
            paths.push(entry.path());
        }
        paths.sort();

        for path in &paths {
            self.add_or_resume_job(path, load_persisted)?;
        }
        info!(dir = ?dir, entries = paths.len(), tracked = self.job_count(), "Scanned watch directory");
        Ok(paths.len())
    }

    /// Reconcile done jobs with the filesystem: resume files that changed size
    /// without a notification, follow renames, and drop files that are gone.
    pub fn maintenance(&self) -> Result<MaintenanceStats> {
        let snapshot: Vec<(Arc<Job>, PathBuf)> = {
            let maps = self.maps.lock();
            maps.jobs
                .iter()
                .filter_map(|(id, job)| maps.paths.get(id).map(|p| (job.clone(), p.clone())))
                .collect()
        };

        let mut stats = MaintenanceStats::default();
        for (job, path) in snapshot {
            let id = job.source_id();

            let size = {
                let state = job.lock();
                if !state.is_done || state.removed {
                    continue;
                }
                match state.file.as_ref() {
                    Some(file) => file.metadata().map_err(|e| Error::file_io(&path, e))?.len(),
                    None => continue,
                }
            };
            if size != job.latest_size() {
                debug!(source_id = %id, size, "Size changed without notification, resuming");
                self.resume_job(&job)?;
                stats.resumed += 1;
                continue;
            }

            match self.check_path(&job, &path) {
                PathCheck::Unchanged => {}
                PathCheck::Moved(new_path) => {
                    self.track_path(id, &new_path);
                    stats.renamed += 1;
                }
                PathCheck::Gone => {
                    if self.remove_job(&job)? {
                        stats.removed += 1;
                    }
                }
            }
        }

        if stats != MaintenanceStats::default() {
            debug!(
                resumed = stats.resumed,
                renamed = stats.renamed,
                removed = stats.removed,
                "Maintenance sweep"
            );
        }
        Ok(stats)
    }

    fn check_path(&self, job: &Job, path: &Path) -> PathCheck {
        let id = job.source_id();
        if let Ok(current) = SourceId::from_path(path) {
            if current == id {
                return PathCheck::Unchanged;
            }
        }

        let resolved = {
            let state = job.lock();
            match state.file.as_ref() {
                Some(file) => get_path_from_file(file),
                None => return PathCheck::Unchanged,
            }
        };
        match resolved {
            Ok(new_path) if SourceId::from_path(&new_path).is_ok_and(|other| other == id) => {
                PathCheck::Moved(new_path)
            }
            _ => PathCheck::Gone,
        }
    }

    /// Drop a done job and close its descriptor. Returns false if the job
    /// became active again in the meantime.
    fn remove_job(&self, job: &Job) -> Result<bool> {
        let id = job.source_id();
        let file = {
            let mut maps = self.maps.lock();
            let mut state = job.lock();
            if !state.is_done || state.removed {
                return Ok(false);
            }
            state.removed = true;
            maps.jobs.remove(&id);
            maps.paths.remove(&id);
            state.file.take()
        };
        drop(file);

        self.done.remove_job(true)?;
        self.metrics.job_removed();
        info!(source_id = %id, "File is gone, stopped tracking");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::{BoundedReceiver, bounded};
    use crate::receivers::file::persistence::{MockPersister, parse_offsets, render_offsets};
    use std::io::Write;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        registry: Arc<JobRegistry>,
        rx: BoundedReceiver<WorkItem>,
        persister: Arc<MockPersister>,
    }

    fn fixture_with(mode: PersistenceMode, capacity: usize, record: OffsetRecord) -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = FileReceiverConfig {
            watch_dir: dir.path().join("logs"),
            offsets_path: dir.path().join("offsets.yaml"),
            persistence_mode: mode,
            ..Default::default()
        };
        fs::create_dir_all(&config.watch_dir).unwrap();
        let (tx, rx) = bounded(capacity);
        let persister = Arc::new(MockPersister::with_record(record));
        let registry = Arc::new(JobRegistry::new(&config, tx, persister.clone()));
        Fixture {
            dir,
            registry,
            rx,
            persister,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(PersistenceMode::Timer, 16, OffsetRecord::default())
    }

    impl Fixture {
        fn write(&self, name: &str, content: &[u8]) -> PathBuf {
            let path = self.dir.path().join("logs").join(name);
            let mut f = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .unwrap();
            f.write_all(content).unwrap();
            path
        }

        fn next_job(&self) -> Arc<Job> {
            match self.rx.try_recv() {
                Some(WorkItem::Job(job)) => job,
                Some(WorkItem::Shutdown) => panic!("unexpected shutdown item"),
                None => panic!("no job queued"),
            }
        }

        /// Run a claim/release cycle as a worker that read to the end.
        fn drain(&self, job: &Arc<Job>, size: u64) -> Release {
            let file = self.registry.claim_job(job).unwrap().unwrap();
            self.registry
                .release_job(
                    job,
                    file,
                    ReadProgress {
                        hit_eof: true,
                        position: size,
                        observed_end: size,
                        size,
                    },
                )
                .unwrap()
        }
    }

    fn persisted(path: &Path, streams: &[(&str, i64)]) -> PersistedSource {
        PersistedSource {
            path: path.to_path_buf(),
            streams: streams.iter().map(|(s, o)| (s.to_string(), *o)).collect(),
        }
    }

    #[test]
    fn test_new_file_is_tracked_and_queued() {
        let f = fixture();
        let path = f.write("a.log", b"hello\n");

        f.registry.add_or_resume_job(&path, false).unwrap();

        let id = SourceId::from_path(&path).unwrap();
        let job = f.next_job();
        assert_eq!(job.source_id(), id);
        assert!(!job.is_done());
        assert_eq!(f.registry.path_of(id), Some(path));
        assert_eq!(f.registry.done_tracker().total(), 1);
        assert_eq!(f.registry.done_tracker().done(), 0);
    }

    #[test]
    fn test_resume_is_idempotent() {
        let f = fixture();
        let path = f.write("a.log", b"hello\n");
        f.registry.add_or_resume_job(&path, false).unwrap();
        let job = f.next_job();
        assert_eq!(f.drain(&job, 6), Release::Done);
        assert!(job.is_done());

        f.registry.resume_job(&job).unwrap();
        f.registry.resume_job(&job).unwrap();
        assert_eq!(f.rx.len(), 1);

        let job = f.next_job();
        assert_eq!(f.drain(&job, 6), Release::Done);
        assert!(job.is_done());
        assert!(f.rx.is_empty());
        assert!(f.registry.wait_until_drained(Duration::from_millis(10)));
    }

    #[test]
    fn test_resume_while_running_requeues_on_release() {
        let f = fixture();
        let path = f.write("a.log", b"hello\n");
        f.registry.add_or_resume_job(&path, false).unwrap();
        let job = f.next_job();

        let file = f.registry.claim_job(&job).unwrap().unwrap();
        f.registry.resume_job(&job).unwrap();
        assert!(f.rx.is_empty());

        let progress = ReadProgress {
            hit_eof: true,
            position: 6,
            observed_end: 6,
            size: 6,
        };
        assert_eq!(
            f.registry.release_job(&job, file, progress).unwrap(),
            Release::Requeue
        );
        assert!(!job.is_done());
        assert_eq!(f.drain(&job, 6), Release::Done);
    }

    #[test]
    fn test_claiming_twice_is_fatal() {
        let f = fixture();
        let path = f.write("a.log", b"x\n");
        f.registry.add_or_resume_job(&path, false).unwrap();
        let job = f.next_job();

        let _file = f.registry.claim_job(&job).unwrap().unwrap();
        assert!(matches!(
            f.registry.claim_job(&job),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_seeks_to_minimum_persisted_offset() {
        let f = fixture();
        let path = f.write("multi.log", &[b'x'; 200]);
        let id = SourceId::from_path(&path).unwrap();
        let mut record = OffsetRecord::default();
        record.insert(id, persisted(&path, &[("a", 100), ("b", 40)]));
        f.persister.save(&record).unwrap();

        assert_eq!(f.registry.load_offsets().unwrap(), 1);
        f.registry.add_or_resume_job(&path, true).unwrap();

        let job = f.next_job();
        assert_eq!(job.position(), 40);
        assert_eq!(job.offset("a"), Some(100));
        assert_eq!(job.offset("b"), Some(40));

        let mut file = f.registry.claim_job(&job).unwrap().unwrap();
        assert_eq!(file.stream_position().unwrap(), 40);
    }

    #[test]
    fn test_persisted_offsets_ignored_when_not_requested() {
        let f = fixture();
        let path = f.write("a.log", &[b'x'; 100]);
        let id = SourceId::from_path(&path).unwrap();
        let mut record = OffsetRecord::default();
        record.insert(id, persisted(&path, &[("default", 60)]));
        f.persister.save(&record).unwrap();
        f.registry.load_offsets().unwrap();

        f.registry.add_or_resume_job(&path, false).unwrap();
        let job = f.registry.job(id).unwrap();
        assert_eq!(job.position(), 0);
        assert!(job.offsets().is_empty());
    }

    #[test]
    fn test_offset_beyond_size_starts_over() {
        let f = fixture();
        let path = f.write("small.log", b"0123456789");
        let id = SourceId::from_path(&path).unwrap();
        let mut record = OffsetRecord::default();
        record.insert(id, persisted(&path, &[("default", 500)]));
        f.persister.save(&record).unwrap();
        f.registry.load_offsets().unwrap();

        f.registry.add_or_resume_job(&path, true).unwrap();
        let job = f.registry.job(id).unwrap();
        assert_eq!(job.position(), 0);
        assert!(job.offsets().is_empty());
    }

    #[test]
    fn test_offsets_file_in_watch_dir_is_fatal() {
        let f = fixture();
        let path = f.dir.path().join("offsets.yaml");
        fs::write(&path, "").unwrap();
        assert!(matches!(
            f.registry.add_or_resume_job(&path, true),
            Err(Error::InvariantViolation(_))
        ));

        let tmp = f.dir.path().join("offsets.yaml.tmp");
        assert!(matches!(
            f.registry.add_or_resume_job(&tmp, false),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_missing_and_non_regular_files_are_skipped() {
        let f = fixture();
        let missing = f.dir.path().join("logs").join("nope.log");
        f.registry.add_or_resume_job(&missing, false).unwrap();

        let subdir = f.dir.path().join("logs").join("nested");
        fs::create_dir(&subdir).unwrap();
        f.registry.add_or_resume_job(&subdir, false).unwrap();

        assert_eq!(f.registry.job_count(), 0);
        assert!(f.rx.is_empty());
    }

    #[test]
    fn test_known_identity_under_new_path_updates_path() {
        let f = fixture();
        let path = f.write("app.log", b"a\n");
        f.registry.add_or_resume_job(&path, false).unwrap();
        let job = f.next_job();
        f.drain(&job, 2);

        let rotated = f.dir.path().join("logs").join("app.log.1");
        fs::rename(&path, &rotated).unwrap();
        f.registry.add_or_resume_job(&rotated, false).unwrap();

        assert_eq!(f.registry.job_count(), 1);
        assert_eq!(f.registry.path_of(job.source_id()), Some(rotated));
        assert!(!job.is_done());
    }

    #[test]
    fn test_commit_must_increase() {
        let f = fixture();
        let path = f.write("a.log", b"a\nb\n");
        f.registry.add_or_resume_job(&path, false).unwrap();
        let id = SourceId::from_path(&path).unwrap();

        f.registry.commit(id, "default", 2).unwrap();
        f.registry.commit(id, "default", 4).unwrap();
        f.registry.commit(id, "other", 2).unwrap();
        assert!(f.registry.is_dirty());

        assert!(matches!(
            f.registry.commit(id, "default", 4),
            Err(Error::InvariantViolation(_))
        ));
        assert!(matches!(
            f.registry.commit(id, "default", 3),
            Err(Error::InvariantViolation(_))
        ));
        assert_eq!(f.registry.job(id).unwrap().offset("default"), Some(4));

        assert!(f.registry.already_committed(id, "default", 4));
        assert!(!f.registry.already_committed(id, "default", 5));
        assert!(!f.registry.already_committed(id, "missing", 1));
    }

    #[test]
    fn test_commit_rejects_unpersistable_stream_names() {
        let f = fixture();
        let path = f.write("a.log", b"abcd\n");
        f.registry.add_or_resume_job(&path, false).unwrap();
        let id = SourceId::from_path(&path).unwrap();

        for stream in ["", " lead", "multi\nline", "cr\r"] {
            assert!(matches!(
                f.registry.commit(id, stream, 4),
                Err(Error::InvariantViolation(_))
            ));
        }
        assert!(!f.registry.is_dirty());
        assert_eq!(f.registry.job(id).unwrap().offset(""), None);

        f.registry.commit(id, "a: b", 4).unwrap();
        f.registry.save_offsets().unwrap();
        let rendered = render_offsets(&f.persister.record());
        let reloaded = parse_offsets(&rendered).unwrap();
        assert_eq!(reloaded.get(&id).unwrap().streams.get("a: b"), Some(&4));
    }

    #[test]
    fn test_commit_for_unknown_source_is_ignored() {
        let f = fixture();
        f.registry.commit(SourceId::new(999), "default", 10).unwrap();
        assert!(!f.registry.is_dirty());
    }

    #[test]
    fn test_sync_mode_saves_on_commit() {
        let f = fixture_with(PersistenceMode::Sync, 4, OffsetRecord::default());
        let path = f.write("a.log", b"abc\n");
        f.registry.add_or_resume_job(&path, false).unwrap();
        let id = SourceId::from_path(&path).unwrap();

        f.registry.commit(id, "default", 4).unwrap();
        assert_eq!(f.persister.save_count(), 1);
        assert!(!f.registry.is_dirty());
        let saved = f.persister.record();
        assert_eq!(saved.get(&id).unwrap().streams.get("default"), Some(&4));
        assert_eq!(saved.get(&id).unwrap().path, path);
    }

    #[test]
    fn test_save_skips_sources_without_commits() {
        let f = fixture();
        let a = f.write("a.log", b"abc\n");
        let b = f.write("b.log", b"xyz\n");
        f.registry.add_or_resume_job(&a, false).unwrap();
        f.registry.add_or_resume_job(&b, false).unwrap();
        let id_a = SourceId::from_path(&a).unwrap();
        f.registry.commit(id_a, "default", 4).unwrap();

        f.registry.save_offsets().unwrap();
        let saved = f.persister.record();
        assert_eq!(saved.len(), 1);
        assert!(saved.get(&id_a).is_some());
        assert!(!f.registry.is_dirty());
    }

    #[test]
    fn test_failed_save_stays_dirty() {
        let f = fixture();
        let path = f.write("a.log", b"abc\n");
        f.registry.add_or_resume_job(&path, false).unwrap();
        f.registry
            .commit(SourceId::from_path(&path).unwrap(), "default", 4)
            .unwrap();

        f.persister.set_fail_saves(true);
        assert!(f.registry.save_offsets().is_err());
        assert!(f.registry.is_dirty());
    }

    #[test]
    fn test_reset_job_zeroes_offsets() {
        let f = fixture();
        let path = f.write("a.log", b"abcdef\n");
        f.registry.add_or_resume_job(&path, false).unwrap();
        let job = f.next_job();
        let id = job.source_id();
        f.registry.commit(id, "default", 7).unwrap();

        let mut file = f.registry.claim_job(&job).unwrap().unwrap();
        file.seek(SeekFrom::Start(7)).unwrap();
        f.registry.reset_job(&job, &mut file).unwrap();

        assert_eq!(file.stream_position().unwrap(), 0);
        assert_eq!(job.offset("default"), Some(0));
        assert!(job.is_running());
        f.registry.commit(id, "default", 3).unwrap();
    }

    #[test]
    fn test_backpressure_blocks_producer() {
        let f = fixture_with(PersistenceMode::Timer, 1, OffsetRecord::default());
        let a = f.write("a.log", b"a\n");
        let b = f.write("b.log", b"b\n");
        f.registry.add_or_resume_job(&a, false).unwrap();

        let registry = f.registry.clone();
        let producer = std::thread::spawn(move || registry.add_or_resume_job(&b, false));
        std::thread::sleep(Duration::from_millis(150));
        assert!(!producer.is_finished());
        assert_eq!(f.rx.len(), 1);

        let _first = f.next_job();
        producer.join().unwrap().unwrap();
        assert_eq!(f.rx.len(), 1);
    }

    #[test]
    fn test_shutdown_unblocks_producer() {
        let f = fixture_with(PersistenceMode::Timer, 1, OffsetRecord::default());
        let a = f.write("a.log", b"a\n");
        let b = f.write("b.log", b"b\n");
        f.registry.add_or_resume_job(&a, false).unwrap();

        let registry = f.registry.clone();
        let producer = std::thread::spawn(move || registry.add_or_resume_job(&b, false));
        std::thread::sleep(Duration::from_millis(50));
        f.registry.begin_shutdown();
        producer.join().unwrap().unwrap();
        assert_eq!(f.rx.len(), 1);
    }

    #[test]
    fn test_scan_directory_tracks_regular_files() {
        let f = fixture();
        f.write("a.log", b"a\n");
        f.write("b.log", b"b\n");
        fs::create_dir(f.dir.path().join("logs").join("sub")).unwrap();

        let entries = f
            .registry
            .scan_directory(&f.dir.path().join("logs"), true)
            .unwrap();
        assert_eq!(entries, 3);
        assert_eq!(f.registry.job_count(), 2);
        assert_eq!(f.rx.len(), 2);
    }

    #[test]
    fn test_maintenance_resumes_grown_file() {
        let f = fixture();
        let path = f.write("a.log", b"abc\n");
        f.registry.add_or_resume_job(&path, false).unwrap();
        let job = f.next_job();
        f.drain(&job, 4);

        assert_eq!(f.registry.maintenance().unwrap(), MaintenanceStats::default());
        assert!(f.rx.is_empty());

        f.write("a.log", b"def\n");
        let stats = f.registry.maintenance().unwrap();
        assert_eq!(stats.resumed, 1);
        assert!(!job.is_done());
        assert!(matches!(f.rx.try_recv(), Some(WorkItem::Job(_))));
    }

    #[test]
    fn test_maintenance_removes_deleted_file() {
        let f = fixture();
        let path = f.write("a.log", b"abc\n");
        f.registry.add_or_resume_job(&path, false).unwrap();
        let job = f.next_job();
        f.drain(&job, 4);

        fs::remove_file(&path).unwrap();
        let stats = f.registry.maintenance().unwrap();
        assert_eq!(stats.removed, 1);
        assert_eq!(f.registry.job_count(), 0);
        assert!(job.is_removed());
        assert_eq!(f.registry.done_tracker().total(), 0);
        assert_eq!(f.registry.done_tracker().done(), 0);
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn test_maintenance_follows_rename() {
        let f = fixture();
        let path = f.write("a.log", b"abc\n");
        f.registry.add_or_resume_job(&path, false).unwrap();
        let job = f.next_job();
        f.drain(&job, 4);

        let moved = f.dir.path().join("archived.log");
        fs::rename(&path, &moved).unwrap();
        let stats = f.registry.maintenance().unwrap();
        assert_eq!(stats.renamed, 1);
        assert_eq!(
            f.registry
                .path_of(job.source_id())
                .unwrap()
                .canonicalize()
                .unwrap(),
            moved.canonicalize().unwrap()
        );
        assert_eq!(f.registry.job_count(), 1);
    }

    #[test]
    fn test_maintenance_skips_busy_jobs() {
        let f = fixture();
        let path = f.write("a.log", b"abc\n");
        f.registry.add_or_resume_job(&path, false).unwrap();
        let _queued = f.next_job();

        fs::remove_file(&path).unwrap();
        assert_eq!(f.registry.maintenance().unwrap(), MaintenanceStats::default());
        assert_eq!(f.registry.job_count(), 1);
    }
}
