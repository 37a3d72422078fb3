// SPDX-License-Identifier: Apache-2.0

//! Configuration for the file receiver.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::receivers::file::watcher::WatchMode;

/// When committed offsets are written to the offsets file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PersistenceMode {
    /// Save synchronously after every commit
    Sync,
    /// Save on a fast fixed timer
    Async,
    /// Save on a slower timer, only when something was committed since the last save
    #[default]
    Timer,
}

impl std::str::FromStr for PersistenceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sync" => Ok(PersistenceMode::Sync),
            "async" => Ok(PersistenceMode::Async),
            "timer" => Ok(PersistenceMode::Timer),
            _ => Err(format!(
                "Invalid persistence mode '{}'. Valid options: sync, async, timer",
                s
            )),
        }
    }
}

/// Configuration for the file receiver
#[derive(Debug, Clone)]
pub struct FileReceiverConfig {
    /// Directory whose files are tailed (non-recursive)
    pub watch_dir: PathBuf,
    /// Path of the offsets file
    pub offsets_path: PathBuf,
    /// When offsets are persisted
    pub persistence_mode: PersistenceMode,
    /// Save interval in async mode
    pub async_interval: Duration,
    /// Save interval in timer mode
    pub timer_interval: Duration,
    /// Read buffer size per worker
    pub read_buffer_size: usize,
    /// Capacity of the bounded work channel
    pub work_queue_capacity: usize,
    /// Number of parallel reader lanes
    pub workers: usize,
    /// Ignore the offsets file on startup and read every file from zero
    pub skip_persisted_offsets: bool,
    /// Interval of the maintenance sweep
    pub maintenance_interval: Duration,
    /// Records longer than this are truncated
    pub max_record_size: usize,
    /// Watch mode: auto, native, or poll
    pub watch_mode: WatchMode,
    /// Poll interval for the poll watcher and for the watcher loop wake-up
    pub poll_interval: Duration,
    /// Debounce interval for native events
    pub debounce_interval: Duration,
    /// Maximum duration of consecutive watcher errors before falling back to polling
    pub max_watcher_error_duration: Duration,
    /// Maximum duration of consecutive checkpoint failures before exiting
    pub max_checkpoint_failure_duration: Duration,
    /// Upper bound on each shutdown step (sentinel delivery, task joins)
    pub shutdown_timeout: Duration,
}

impl Default for FileReceiverConfig {
    fn default() -> Self {
        Self {
            watch_dir: PathBuf::new(),
            offsets_path: PathBuf::from("/var/lib/logtrail/offsets.yaml"),
            persistence_mode: PersistenceMode::Timer,
            async_interval: Duration::from_millis(100),
            timer_interval: Duration::from_secs(5),
            read_buffer_size: 256 * 1024,
            work_queue_capacity: 64,
            workers: 4,
            skip_persisted_offsets: false,
            maintenance_interval: Duration::from_secs(5),
            max_record_size: 1024 * 1024,
            watch_mode: WatchMode::Auto,
            poll_interval: Duration::from_millis(250),
            debounce_interval: Duration::from_millis(100),
            max_watcher_error_duration: Duration::from_secs(60),
            max_checkpoint_failure_duration: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl FileReceiverConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.watch_dir.as_os_str().is_empty() {
            return Err("A watch directory must be specified".to_string());
        }
        if self.offsets_path.as_os_str().is_empty() {
            return Err("An offsets file path must be specified".to_string());
        }
        if self.read_buffer_size == 0 {
            return Err("Read buffer size must be greater than zero".to_string());
        }
        if self.work_queue_capacity == 0 {
            return Err("Work queue capacity must be greater than zero".to_string());
        }
        if self.workers == 0 {
            return Err("At least one worker is required".to_string());
        }
        if self.max_record_size == 0 {
            return Err("Maximum record size must be greater than zero".to_string());
        }
        if self.maintenance_interval.is_zero() {
            return Err("Maintenance interval must be greater than zero".to_string());
        }
        if self.async_interval.is_zero() {
            return Err("Async save interval must be greater than zero".to_string());
        }
        if self.timer_interval.is_zero() {
            return Err("Timer save interval must be greater than zero".to_string());
        }
        if self.poll_interval.is_zero() {
            return Err("Poll interval must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Path of the temporary file written before the atomic rename
    pub fn offsets_tmp_path(&self) -> PathBuf {
        tmp_path_for(&self.offsets_path)
    }
}

/// `<path>.tmp`, appended rather than replacing any existing extension.
pub fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
