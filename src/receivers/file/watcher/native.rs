// SPDX-License-Identifier: Apache-2.0

//! Native directory watcher built on the `notify` crate (inotify, FSEvents,
//! ReadDirectoryChangesW).

use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError, channel};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use super::traits::{FileEvent, FileEventKind, FileWatcher, WatcherError};

pub struct NativeWatcher {
    watcher: RecommendedWatcher,
    receiver: Receiver<Result<Event, notify::Error>>,
}

impl NativeWatcher {
    pub fn new(debounce: Duration) -> Result<Self, WatcherError> {
        let (tx, rx) = channel();

        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(debounce),
        )
        .map_err(|e| WatcherError::Init(e.to_string()))?;

        Ok(Self {
            watcher,
            receiver: rx,
        })
    }

    fn convert_event(event: Event) -> Option<FileEvent> {
        let kind = match event.kind {
            EventKind::Create(_) => FileEventKind::Create,
            EventKind::Modify(_) => FileEventKind::Modify,
            EventKind::Remove(_) => FileEventKind::Remove,
            EventKind::Access(_) => return None,
            EventKind::Other | EventKind::Any => FileEventKind::Other,
        };
        if event.paths.is_empty() {
            return None;
        }
        Some(FileEvent::new(kind, event.paths))
    }

    /// Sort one backend message into `events`, remembering the last error.
    fn absorb(
        message: Result<Event, notify::Error>,
        events: &mut Vec<FileEvent>,
        last_error: &mut Option<notify::Error>,
    ) {
        match message {
            Ok(event) => events.extend(Self::convert_event(event)),
            Err(e) => {
                tracing::warn!(error = %e, "File watcher error");
                *last_error = Some(e);
            }
        }
    }
}

impl FileWatcher for NativeWatcher {
    fn watch(&mut self, dir: &Path) -> Result<(), WatcherError> {
        self.watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| WatcherError::Watch(e.to_string()))
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<FileEvent>, WatcherError> {
        let mut events = Vec::new();
        let mut last_error = None;

        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Self::absorb(message, &mut events, &mut last_error),
            Err(RecvTimeoutError::Timeout) => return Ok(events),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(WatcherError::Channel("watcher channel disconnected".into()));
            }
        }

        loop {
            match self.receiver.try_recv() {
                Ok(message) => Self::absorb(message, &mut events, &mut last_error),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    return Err(WatcherError::Channel("watcher channel disconnected".into()));
                }
            }
        }

        match last_error {
            Some(e) if events.is_empty() => Err(WatcherError::Backend(e.to_string())),
            _ => Ok(events),
        }
    }

    fn is_native(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        #[cfg(target_os = "linux")]
        {
            "inotify"
        }
        #[cfg(target_os = "macos")]
        {
            "FSEvents"
        }
        #[cfg(target_os = "windows")]
        {
            "ReadDirectoryChangesW"
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            "native"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::TempDir;

    fn collect_for(watcher: &mut NativeWatcher, total: Duration) -> Vec<FileEvent> {
        let deadline = std::time::Instant::now() + total;
        let mut events = Vec::new();
        while std::time::Instant::now() < deadline {
            events.extend(watcher.recv_timeout(Duration::from_millis(100)).unwrap());
        }
        events
    }

    #[test]
    fn test_native_watcher_detects_create() {
        let temp_dir = TempDir::new().unwrap();
        let mut watcher = NativeWatcher::new(Duration::from_millis(50)).unwrap();
        watcher.watch(temp_dir.path()).unwrap();

        File::create(temp_dir.path().join("test.log")).unwrap();

        let events = collect_for(&mut watcher, Duration::from_secs(1));
        assert!(
            events.iter().any(|e| e.kind == FileEventKind::Create),
            "expected a create event, got {:?}",
            events
        );
    }

    #[test]
    fn test_native_watcher_detects_append() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("test.log");
        fs::write(&file_path, b"initial\n").unwrap();

        let mut watcher = NativeWatcher::new(Duration::from_millis(50)).unwrap();
        watcher.watch(temp_dir.path()).unwrap();
        let _ = collect_for(&mut watcher, Duration::from_millis(200));

        let mut file = fs::OpenOptions::new().append(true).open(&file_path).unwrap();
        file.write_all(b"more\n").unwrap();
        drop(file);

        let events = collect_for(&mut watcher, Duration::from_secs(2));
        assert!(events.iter().any(|e| {
            matches!(e.kind, FileEventKind::Modify | FileEventKind::Create)
                && e.paths.iter().any(|p| p.ends_with("test.log"))
        }));
    }

    #[test]
    fn test_native_watcher_times_out_empty() {
        let temp_dir = TempDir::new().unwrap();
        let mut watcher = NativeWatcher::new(Duration::from_millis(50)).unwrap();
        watcher.watch(temp_dir.path()).unwrap();

        let events = watcher.recv_timeout(Duration::from_millis(50)).unwrap();
        assert!(events.is_empty());
        assert!(watcher.is_native());
    }
}
