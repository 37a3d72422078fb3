// SPDX-License-Identifier: Apache-2.0

use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::receivers::file::config::{FileReceiverConfig, PersistenceMode};
use crate::receivers::file::watcher::WatchMode;

/// When committed offsets are written to disk
#[derive(Copy, Clone, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum PersistenceModeArg {
    /// Save after every commit
    Sync,
    /// Save on a short fixed interval
    Async,
    /// Save on a longer interval, only if something changed
    #[default]
    Timer,
}

impl From<PersistenceModeArg> for PersistenceMode {
    fn from(m: PersistenceModeArg) -> Self {
        match m {
            PersistenceModeArg::Sync => PersistenceMode::Sync,
            PersistenceModeArg::Async => PersistenceMode::Async,
            PersistenceModeArg::Timer => PersistenceMode::Timer,
        }
    }
}

/// Watch mode for file system monitoring
#[derive(Copy, Clone, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum WatchModeArg {
    /// Automatically select the best watching strategy (native first, poll fallback)
    #[default]
    Auto,
    /// Force native file system watching (inotify/kqueue/FSEvents)
    Native,
    /// Force polling mode (use for NFS or when native watching is unreliable)
    Poll,
}

impl From<WatchModeArg> for WatchMode {
    fn from(w: WatchModeArg) -> Self {
        match w {
            WatchModeArg::Auto => WatchMode::Auto,
            WatchModeArg::Native => WatchMode::Native,
            WatchModeArg::Poll => WatchMode::Poll,
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct FileReceiverArgs {
    /// Directory whose files are tailed (not recursive)
    #[arg(long, env = "LOGTRAIL_WATCH_DIR")]
    pub watch_dir: PathBuf,

    /// Path to store file offsets for persistence across restarts
    #[arg(
        long,
        env = "LOGTRAIL_OFFSETS_PATH",
        default_value = "/var/lib/logtrail/offsets.yaml"
    )]
    pub offsets_path: PathBuf,

    /// Offset persistence mode: sync, async, timer
    #[arg(
        value_enum,
        long,
        env = "LOGTRAIL_PERSISTENCE_MODE",
        default_value = "timer"
    )]
    pub persistence_mode: PersistenceModeArg,

    /// Save interval in async mode (e.g. "100ms")
    #[arg(
        long,
        env = "LOGTRAIL_ASYNC_INTERVAL",
        default_value = "100ms",
        value_parser = humantime::parse_duration
    )]
    pub async_interval: Duration,

    /// Save interval in timer mode (e.g. "5s")
    #[arg(
        long,
        env = "LOGTRAIL_TIMER_INTERVAL",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub timer_interval: Duration,

    /// Size in bytes of each worker's read buffer
    #[arg(long, env = "LOGTRAIL_READ_BUFFER_SIZE", default_value = "262144")]
    pub read_buffer_size: usize,

    /// Capacity of the work queue between the watcher and the workers
    #[arg(long, env = "LOGTRAIL_WORK_QUEUE_CAPACITY", default_value = "64")]
    pub work_queue_capacity: usize,

    /// Number of parallel reader threads
    #[arg(long, env = "LOGTRAIL_WORKERS", default_value = "4")]
    pub workers: usize,

    /// Ignore the offsets file and read every file from the start
    #[arg(long, env = "LOGTRAIL_SKIP_PERSISTED_OFFSETS", default_value = "false")]
    pub skip_persisted_offsets: bool,

    /// Interval of the sweep that catches missed writes and deleted files
    #[arg(
        long,
        env = "LOGTRAIL_MAINTENANCE_INTERVAL",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub maintenance_interval: Duration,

    /// Maximum record size in bytes (longer records are truncated)
    #[arg(long, env = "LOGTRAIL_MAX_RECORD_SIZE", default_value = "1048576")]
    pub max_record_size: usize,

    /// Watch mode: auto (default), native (inotify/kqueue/FSEvents), poll (for NFS)
    #[arg(
        value_enum,
        long,
        env = "LOGTRAIL_WATCH_MODE",
        default_value = "auto"
    )]
    pub watch_mode: WatchModeArg,

    /// Poll interval for checking file changes (used in poll mode or as fallback)
    #[arg(
        long,
        env = "LOGTRAIL_POLL_INTERVAL",
        default_value = "250ms",
        value_parser = humantime::parse_duration
    )]
    pub poll_interval: Duration,

    /// Debounce interval for the native watcher to coalesce rapid events
    #[arg(
        long,
        env = "LOGTRAIL_DEBOUNCE_INTERVAL",
        default_value = "100ms",
        value_parser = humantime::parse_duration
    )]
    pub debounce_interval: Duration,

    /// Maximum duration of consecutive watcher errors before falling back to polling
    #[arg(
        long,
        env = "LOGTRAIL_MAX_WATCHER_ERROR_DURATION",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub max_watcher_error_duration: Duration,

    /// Maximum duration of consecutive offset save failures before exiting
    #[arg(
        long,
        env = "LOGTRAIL_MAX_CHECKPOINT_FAILURE_DURATION",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub max_checkpoint_failure_duration: Duration,

    /// Maximum time to wait for each shutdown step
    #[arg(
        long,
        env = "LOGTRAIL_SHUTDOWN_TIMEOUT",
        default_value = "3s",
        value_parser = humantime::parse_duration
    )]
    pub shutdown_timeout: Duration,
}

impl FileReceiverArgs {
    /// Build the receiver config from command line args
    pub fn build_config(&self) -> FileReceiverConfig {
        FileReceiverConfig {
            watch_dir: self.watch_dir.clone(),
            offsets_path: self.offsets_path.clone(),
            persistence_mode: self.persistence_mode.into(),
            async_interval: self.async_interval,
            timer_interval: self.timer_interval,
            read_buffer_size: self.read_buffer_size,
            work_queue_capacity: self.work_queue_capacity,
            workers: self.workers,
            skip_persisted_offsets: self.skip_persisted_offsets,
            maintenance_interval: self.maintenance_interval,
            max_record_size: self.max_record_size,
            watch_mode: self.watch_mode.into(),
            poll_interval: self.poll_interval,
            debounce_interval: self.debounce_interval,
            max_watcher_error_duration: self.max_watcher_error_duration,
            max_checkpoint_failure_duration: self.max_checkpoint_failure_duration,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}
