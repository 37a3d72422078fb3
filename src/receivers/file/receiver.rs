// SPDX-License-Identifier: Apache-2.0

//! File receiver: tails every file in one directory and hands each record to
//! a [`RecordSink`], keeping committed offsets durable across restarts.
//!
//! Architecture:
//! - A watcher thread turns create/write notifications into jobs.
//! - Worker threads (one per lane) read jobs off a bounded channel.
//! - A maintenance task catches missed notifications and deleted files.
//! - An offset committer task persists offsets on the configured schedule.
//!
//! Any fatal error stops all of them; [`FileReceiver::run`] then returns it.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::{BoundedReceiver, bounded};
use crate::receivers::file::committer::{OffsetCommitter, OffsetCommitterConfig};
use crate::receivers::file::config::FileReceiverConfig;
use crate::receivers::file::error::{Error, Result};
use crate::receivers::file::job::WorkItem;
use crate::receivers::file::maintenance::MaintenanceLoop;
use crate::receivers::file::persistence::{OffsetFile, OffsetFilePersister, Persister};
use crate::receivers::file::registry::JobRegistry;
use crate::receivers::file::sink::RecordSink;
use crate::receivers::file::supervisor::Supervisor;
use crate::receivers::file::watcher::{DirWatcher, WatcherConfig};
use crate::receivers::file::worker::{ReadLimits, WorkerPool};

pub struct FileReceiver {
    config: FileReceiverConfig,
    registry: Arc<JobRegistry>,
    work_rx: BoundedReceiver<WorkItem>,
}

/// Handles of everything started after the worker pool.
#[derive(Default)]
struct Background {
    watcher: Option<thread::JoinHandle<()>>,
    maintenance: Option<JoinHandle<()>>,
    committer: Option<JoinHandle<()>>,
}

impl FileReceiver {
    /// Receiver persisting offsets to `config.offsets_path`.
    pub fn new(config: FileReceiverConfig) -> Result<Self> {
        let persister = Arc::new(OffsetFilePersister::new(OffsetFile::new(
            config.offsets_path.clone(),
        )));
        Self::with_persister(config, persister)
    }

    pub fn with_persister(config: FileReceiverConfig, persister: Arc<dyn Persister>) -> Result<Self> {
        config.validate().map_err(Error::Config)?;

        let (work_tx, work_rx) = bounded(config.work_queue_capacity);
        let registry = Arc::new(JobRegistry::new(&config, work_tx, persister));
        Ok(Self {
            config,
            registry,
            work_rx,
        })
    }

    /// Shared registry, for sinks that commit offsets.
    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    /// Run until `cancel` fires or a fatal error occurs. Offsets are saved one
    /// last time before returning, whatever the persistence mode.
    pub async fn run(self, sink: Arc<dyn RecordSink>, cancel: CancellationToken) -> Result<()> {
        info!(
            dir = ?self.config.watch_dir,
            offsets = ?self.config.offsets_path,
            workers = self.config.workers,
            persistence = ?self.config.persistence_mode,
            watch_mode = ?self.config.watch_mode,
            "Starting file receiver"
        );

        let stop = cancel.child_token();
        let supervisor = Arc::new(Supervisor::new(stop.clone()));

        if self.config.skip_persisted_offsets {
            info!("Ignoring persisted offsets, every file is read from the start");
        } else {
            let registry = self.registry.clone();
            join_blocking(move || registry.load_offsets()).await?;
        }

        let pool = WorkerPool::start(
            self.config.workers,
            self.work_rx,
            self.registry.clone(),
            sink,
            supervisor.clone(),
            ReadLimits {
                read_buffer_size: self.config.read_buffer_size,
                max_record_size: self.config.max_record_size,
            },
        )?;

        let mut background = Background::default();
        match start_background(&self.config, &self.registry, &supervisor, &stop, &mut background)
            .await
        {
            Ok(()) => stop.cancelled().await,
            Err(e) => supervisor.fatal("File receiver failed to start", e),
        }

        shutdown(&self.config, &self.registry, &stop, pool, background).await;

        let registry = self.registry.clone();
        let saved = join_blocking(move || registry.save_offsets()).await;

        if let Some(e) = supervisor.take_error() {
            return Err(e);
        }
        saved?;
        info!("File receiver stopped");
        Ok(())
    }
}

async fn start_background(
    config: &FileReceiverConfig,
    registry: &Arc<JobRegistry>,
    supervisor: &Arc<Supervisor>,
    stop: &CancellationToken,
    background: &mut Background,
) -> Result<()> {
    // register the watch first so nothing created during the scan is missed
    let watcher = {
        let dir = config.watch_dir.clone();
        let watcher_config = WatcherConfig::from(config);
        let registry = registry.clone();
        let supervisor = supervisor.clone();
        join_blocking(move || DirWatcher::new(&dir, watcher_config, registry, supervisor)).await?
    };

    {
        let dir = config.watch_dir.clone();
        let load_persisted = !config.skip_persisted_offsets;
        let registry = registry.clone();
        join_blocking(move || registry.scan_directory(&dir, load_persisted)).await?;
    }

    background.watcher = Some(watcher.spawn(stop.clone())?);

    background.maintenance = Some(tokio::spawn(
        MaintenanceLoop::new(
            registry.clone(),
            supervisor.clone(),
            config.maintenance_interval,
        )
        .run(stop.clone()),
    ));

    let mut committer = OffsetCommitter::new(registry.clone(), OffsetCommitterConfig::from(config));
    let committer_supervisor = supervisor.clone();
    let committer_stop = stop.clone();
    background.committer = Some(tokio::spawn(async move {
        if let Err(e) = committer.run(committer_stop).await {
            committer_supervisor.fatal("Offset committer failed", e);
        }
    }));

    Ok(())
}

/// Stop everything in order: watcher, workers, then the periodic tasks.
async fn shutdown(
    config: &FileReceiverConfig,
    registry: &Arc<JobRegistry>,
    stop: &CancellationToken,
    pool: WorkerPool,
    background: Background,
) {
    debug!("Shutting down file receiver");
    registry.begin_shutdown();
    stop.cancel();
    let timeout = config.shutdown_timeout;

    if let Some(handle) = background.watcher {
        join_thread("watcher", handle, timeout).await;
    }

    let lanes = pool.lanes();
    let tx = registry.work_sender();
    let sent = tokio::task::spawn_blocking(move || {
        let mut sent = 0;
        for _ in 0..lanes {
            match tx.send_timeout(WorkItem::Shutdown, timeout) {
                Ok(()) => sent += 1,
                Err(_) => break,
            }
        }
        sent
    })
    .await
    .unwrap_or(0);
    if sent < lanes {
        warn!(sent, lanes, "Could not deliver a shutdown signal to every worker");
    }

    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || pool.join())).await {
        Ok(Ok(())) => debug!("Worker pool stopped"),
        Ok(Err(e)) => error!(error = %e, "Failed to join worker pool"),
        Err(_) => warn!("Timeout waiting for workers to stop"),
    }

    for (name, task) in [
        ("maintenance", background.maintenance),
        ("offset committer", background.committer),
    ] {
        let Some(task) = task else { continue };
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, task = name, "Task failed"),
            Err(_) => warn!(task = name, "Timeout waiting for task to stop"),
        }
    }
}

async fn join_thread(name: &str, handle: thread::JoinHandle<()>, timeout: Duration) {
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || handle.join())).await {
        Ok(Ok(Ok(()))) => debug!(thread = name, "Thread joined"),
        Ok(Ok(Err(_))) => error!(thread = name, "Thread panicked"),
        Ok(Err(e)) => error!(thread = name, error = %e, "Failed to join thread"),
        Err(_) => warn!(thread = name, "Timeout waiting for thread to stop"),
    }
}

/// Run blocking filesystem work off the async runtime.
async fn join_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::invariant(format!("blocking task failed: {}", e)))?
}
