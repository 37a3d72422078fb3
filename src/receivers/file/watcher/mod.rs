// SPDX-License-Identifier: Apache-2.0

//! Directory watching for the file receiver.
//!
//! Two strategies are available:
//! - **Native**: OS notifications (inotify, FSEvents, ReadDirectoryChangesW).
//! - **Poll**: periodic directory scans, for network file systems.
//!
//! `auto` tries native first and falls back to polling. Whatever the backend,
//! missed notifications are eventually caught by the maintenance sweep.

mod native;
mod poll;
mod traits;

pub use native::NativeWatcher;
pub use poll::PollWatcher;
pub use traits::{FileEvent, FileEventKind, FileWatcher, WatcherError};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::receivers::file::config::FileReceiverConfig;
use crate::receivers::file::error::{Error, Result};
use crate::receivers::file::registry::JobRegistry;
use crate::receivers::file::supervisor::Supervisor;

/// Watch mode configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WatchMode {
    /// Native first, polling if native watching cannot start.
    #[default]
    Auto,
    /// Native only. Fails if unsupported.
    Native,
    /// Polling only
    Poll,
}

impl std::str::FromStr for WatchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(WatchMode::Auto),
            "native" => Ok(WatchMode::Native),
            "poll" | "polling" => Ok(WatchMode::Poll),
            _ => Err(format!(
                "Invalid watch mode '{}'. Valid options: auto, native, poll",
                s
            )),
        }
    }
}

/// Configuration for the directory watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub mode: WatchMode,
    /// Scan interval of the poll backend, and how often the event loop checks
    /// for cancellation.
    pub poll_interval: Duration,
    pub debounce_interval: Duration,
    /// How long backend errors may persist before switching to polling.
    pub max_error_duration: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            mode: WatchMode::Auto,
            poll_interval: Duration::from_millis(250),
            debounce_interval: Duration::from_millis(100),
            max_error_duration: Duration::from_secs(60),
        }
    }
}

impl From<&FileReceiverConfig> for WatcherConfig {
    fn from(config: &FileReceiverConfig) -> Self {
        Self {
            mode: config.watch_mode,
            poll_interval: config.poll_interval,
            debounce_interval: config.debounce_interval,
            max_error_duration: config.max_watcher_error_duration,
        }
    }
}

/// Create a watcher for the configured mode.
pub fn create_watcher(
    config: &WatcherConfig,
) -> std::result::Result<Box<dyn FileWatcher>, WatcherError> {
    match config.mode {
        WatchMode::Native => Ok(Box::new(NativeWatcher::new(config.debounce_interval)?)),
        WatchMode::Poll => Ok(Box::new(PollWatcher::new(config.poll_interval))),
        WatchMode::Auto => match NativeWatcher::new(config.debounce_interval) {
            Ok(watcher) => Ok(Box::new(watcher)),
            Err(e) => {
                warn!(error = %e, "Native file watching unavailable, falling back to polling");
                Ok(Box::new(PollWatcher::new(config.poll_interval)))
            }
        },
    }
}

/// Feeds create and write notifications for one directory into the registry.
///
/// The OS watch is registered in [`DirWatcher::new`], before the startup
/// scan, and events are only consumed once [`DirWatcher::spawn`] runs after
/// it. Files created in between are reported rather than lost.
pub struct DirWatcher {
    watcher: Box<dyn FileWatcher>,
    dir: PathBuf,
    config: WatcherConfig,
    registry: Arc<JobRegistry>,
    supervisor: Arc<Supervisor>,
    failing_since: Option<Instant>,
}

impl DirWatcher {
    pub fn new(
        dir: &Path,
        config: WatcherConfig,
        registry: Arc<JobRegistry>,
        supervisor: Arc<Supervisor>,
    ) -> Result<Self> {
        let mut watcher = create_watcher(&config).map_err(|e| Error::Watcher(e.to_string()))?;
        if let Err(e) = watcher.watch(dir) {
            if config.mode != WatchMode::Auto || !watcher.is_native() {
                return Err(Error::Watcher(e.to_string()));
            }
            warn!(error = %e, dir = ?dir, "Native watch failed, falling back to polling");
            watcher = Box::new(PollWatcher::new(config.poll_interval));
            watcher
                .watch(dir)
                .map_err(|e| Error::Watcher(e.to_string()))?;
        }
        info!(dir = ?dir, backend = watcher.backend_name(), "Watching directory");

        Ok(Self {
            watcher,
            dir: dir.to_path_buf(),
            config,
            registry,
            supervisor,
            failing_since: None,
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.watcher.backend_name()
    }

    /// Run the event loop on its own thread until `cancel` fires. The watcher,
    /// and with it the OS handle, is dropped when the loop exits.
    pub fn spawn(self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name("logtrail-watcher".to_string())
            .spawn(move || self.run(cancel))?;
        Ok(handle)
    }

    fn run(mut self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            match self.watcher.recv_timeout(self.config.poll_interval) {
                Ok(events) => {
                    self.failing_since = None;
                    for event in events {
                        self.handle_event(event);
                    }
                }
                Err(e) => self.handle_error(e),
            }
        }
        debug!(dir = ?self.dir, "Watcher stopped");
    }

    fn handle_event(&self, event: FileEvent) {
        let created = match event.kind {
            FileEventKind::Create => true,
            FileEventKind::Modify => false,
            // removals are reclaimed by maintenance
            FileEventKind::Remove | FileEventKind::Other => return,
        };

        for path in event.paths {
            if created {
                self.registry.note_discovered();
            }
            if let Err(e) = self.registry.add_or_resume_job(&path, false) {
                self.supervisor
                    .report(&format!("Failed to handle event for {:?}", path), e);
            }
        }
    }

    fn handle_error(&mut self, e: WatcherError) {
        let since = *self.failing_since.get_or_insert_with(Instant::now);
        warn!(error = %e, backend = self.watcher.backend_name(), "Watcher error");

        if since.elapsed() < self.config.max_error_duration {
            // avoid spinning on a backend that fails immediately
            std::thread::sleep(self.config.poll_interval);
            return;
        }

        if !self.watcher.is_native() {
            self.supervisor.report(
                "Poll watcher keeps failing",
                Error::Watcher(e.to_string()),
            );
            std::thread::sleep(self.config.poll_interval);
            return;
        }

        let mut fallback = PollWatcher::new(self.config.poll_interval);
        match fallback.watch(&self.dir) {
            Ok(()) => {
                warn!(dir = ?self.dir, "Native watcher kept failing, switching to polling");
                self.watcher = Box::new(fallback);
                self.failing_since = None;
            }
            Err(e) => {
                warn!(error = %e, "Could not start poll watcher");
                std::thread::sleep(self.config.poll_interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::bounded;
    use crate::receivers::file::input::SourceId;
    use crate::receivers::file::job::WorkItem;
    use crate::receivers::file::persistence::MockPersister;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_watch_mode_from_str() {
        assert_eq!("auto".parse::<WatchMode>().unwrap(), WatchMode::Auto);
        assert_eq!("native".parse::<WatchMode>().unwrap(), WatchMode::Native);
        assert_eq!("poll".parse::<WatchMode>().unwrap(), WatchMode::Poll);
        assert_eq!("polling".parse::<WatchMode>().unwrap(), WatchMode::Poll);
        assert_eq!("AUTO".parse::<WatchMode>().unwrap(), WatchMode::Auto);
        assert!("invalid".parse::<WatchMode>().is_err());
    }

    #[test]
    fn test_created_file_is_tracked() {
        let dir = TempDir::new().unwrap();
        let config = FileReceiverConfig {
            watch_dir: dir.path().to_path_buf(),
            offsets_path: dir.path().join("state").join("offsets.yaml"),
            ..Default::default()
        };
        let (tx, rx) = bounded(8);
        let registry = Arc::new(JobRegistry::new(
            &config,
            tx,
            Arc::new(MockPersister::new()),
        ));
        let cancel = CancellationToken::new();
        let supervisor = Arc::new(Supervisor::new(cancel.clone()));

        let watcher_config = WatcherConfig {
            mode: WatchMode::Poll,
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let watcher = DirWatcher::new(dir.path(), watcher_config, registry.clone(), supervisor)
            .unwrap();
        assert_eq!(watcher.backend_name(), "poll");
        let handle = watcher.spawn(cancel.clone()).unwrap();

        let path = dir.path().join("new.log");
        fs::write(&path, b"hello\n").unwrap();

        let item = rx.recv_timeout(Duration::from_secs(2));
        cancel.cancel();
        handle.join().unwrap();

        match item {
            Some(WorkItem::Job(job)) => {
                assert_eq!(job.source_id(), SourceId::from_path(&path).unwrap())
            }
            _ => panic!("expected the new file to be queued"),
        }
        assert_eq!(registry.files_discovered(), 1);
    }

    #[test]
    fn test_offsets_file_event_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = FileReceiverConfig {
            watch_dir: dir.path().to_path_buf(),
            offsets_path: dir.path().join("offsets.yaml"),
            ..Default::default()
        };
        let (tx, _rx) = bounded(8);
        let registry = Arc::new(JobRegistry::new(
            &config,
            tx,
            Arc::new(MockPersister::new()),
        ));
        let cancel = CancellationToken::new();
        let supervisor = Arc::new(Supervisor::new(cancel.clone()));

        let watcher_config = WatcherConfig {
            mode: WatchMode::Poll,
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let watcher =
            DirWatcher::new(dir.path(), watcher_config, registry, supervisor.clone()).unwrap();
        let handle = watcher.spawn(cancel.clone()).unwrap();

        fs::write(dir.path().join("offsets.yaml"), b"").unwrap();
        handle.join().unwrap();

        assert!(matches!(
            supervisor.take_error(),
            Some(Error::InvariantViolation(_))
        ));
    }
}
