// SPDX-License-Identifier: Apache-2.0

//! Periodic persistence of committed offsets.
//!
//! In `sync` mode every commit saves on its own and this task only waits for
//! cancellation. The final save on shutdown belongs to the receiver, not here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::select;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::receivers::file::config::{FileReceiverConfig, PersistenceMode};
use crate::receivers::file::error::Result;
use crate::receivers::file::registry::JobRegistry;

/// Configuration for the offset committer
#[derive(Debug, Clone)]
pub struct OffsetCommitterConfig {
    pub mode: PersistenceMode,
    pub async_interval: Duration,
    pub timer_interval: Duration,
    /// Maximum duration of consecutive save failures before returning error
    pub max_checkpoint_failure_duration: Duration,
}

impl From<&FileReceiverConfig> for OffsetCommitterConfig {
    fn from(config: &FileReceiverConfig) -> Self {
        Self {
            mode: config.persistence_mode,
            async_interval: config.async_interval,
            timer_interval: config.timer_interval,
            max_checkpoint_failure_duration: config.max_checkpoint_failure_duration,
        }
    }
}

pub struct OffsetCommitter {
    registry: Arc<JobRegistry>,
    config: OffsetCommitterConfig,
    /// When consecutive save failures started
    checkpoint_first_failure: Option<Instant>,
}

impl OffsetCommitter {
    pub fn new(registry: Arc<JobRegistry>, config: OffsetCommitterConfig) -> Self {
        Self {
            registry,
            config,
            checkpoint_first_failure: None,
        }
    }

    /// Save on the configured schedule until cancelled. Returns an error only
    /// when saves keep failing beyond the configured threshold.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let period = match self.config.mode {
            PersistenceMode::Sync => {
                cancel.cancelled().await;
                return Ok(());
            }
            PersistenceMode::Async => self.config.async_interval,
            PersistenceMode::Timer => self.config.timer_interval,
        };

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Offset committer cancelled");
                    return Ok(());
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.maybe_checkpoint() {
                        error!(error = %e, "Offset save failures persisted beyond threshold");
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Save if due, tracking how long saves have been failing. Returns Err
    /// only when the failure threshold is breached.
    fn maybe_checkpoint(&mut self) -> Result<()> {
        if self.config.mode == PersistenceMode::Timer && !self.registry.is_dirty() {
            return Ok(());
        }

        match self.registry.save_offsets() {
            Ok(()) => {
                if self.checkpoint_first_failure.take().is_some() {
                    debug!("Offset save succeeded after previous failures");
                }
                Ok(())
            }
            Err(e) => {
                let first_failure = *self
                    .checkpoint_first_failure
                    .get_or_insert_with(Instant::now);
                let failing_for = first_failure.elapsed();

                if failing_for >= self.config.max_checkpoint_failure_duration {
                    Err(e)
                } else {
                    warn!(error = %e, failing_for = ?failing_for, "Offset save failed");
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::bounded;
    use crate::receivers::file::input::SourceId;
    use crate::receivers::file::persistence::MockPersister;
    use std::fs;
    use tempfile::TempDir;

    struct Setup {
        _dir: TempDir,
        registry: Arc<JobRegistry>,
        persister: Arc<MockPersister>,
        id: SourceId,
    }

    fn setup(mode: PersistenceMode) -> Setup {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"abc\n").unwrap();
        let config = FileReceiverConfig {
            watch_dir: dir.path().to_path_buf(),
            offsets_path: dir.path().join("state").join("offsets.yaml"),
            persistence_mode: mode,
            ..Default::default()
        };
        let (tx, _rx) = bounded(4);
        let persister = Arc::new(MockPersister::new());
        let registry = Arc::new(JobRegistry::new(&config, tx, persister.clone()));
        registry.add_or_resume_job(&path, false).unwrap();
        Setup {
            _dir: dir,
            registry,
            persister,
            id: SourceId::from_path(&path).unwrap(),
        }
    }

    fn committer(s: &Setup, mode: PersistenceMode, threshold: Duration) -> OffsetCommitter {
        OffsetCommitter::new(
            s.registry.clone(),
            OffsetCommitterConfig {
                mode,
                async_interval: Duration::from_millis(10),
                timer_interval: Duration::from_millis(10),
                max_checkpoint_failure_duration: threshold,
            },
        )
    }

    #[test]
    fn test_timer_mode_saves_only_when_dirty() {
        let s = setup(PersistenceMode::Timer);
        let mut committer = committer(&s, PersistenceMode::Timer, Duration::from_secs(60));

        committer.maybe_checkpoint().unwrap();
        assert_eq!(s.persister.save_count(), 0);

        s.registry.commit(s.id, "default", 4).unwrap();
        committer.maybe_checkpoint().unwrap();
        committer.maybe_checkpoint().unwrap();
        assert_eq!(s.persister.save_count(), 1);
    }

    #[test]
    fn test_async_mode_saves_every_tick() {
        let s = setup(PersistenceMode::Async);
        let mut committer = committer(&s, PersistenceMode::Async, Duration::from_secs(60));

        committer.maybe_checkpoint().unwrap();
        committer.maybe_checkpoint().unwrap();
        assert_eq!(s.persister.save_count(), 2);
    }

    #[test]
    fn test_checkpoint_failure_threshold() {
        let s = setup(PersistenceMode::Async);
        let mut committer = committer(&s, PersistenceMode::Async, Duration::from_millis(50));
        s.persister.set_fail_saves(true);

        assert!(committer.maybe_checkpoint().is_ok());
        std::thread::sleep(Duration::from_millis(60));
        assert!(committer.maybe_checkpoint().is_err());
    }

    #[test]
    fn test_checkpoint_failure_resets_on_success() {
        let s = setup(PersistenceMode::Async);
        let mut committer = committer(&s, PersistenceMode::Async, Duration::from_millis(100));
        committer.checkpoint_first_failure = Some(Instant::now());

        committer.maybe_checkpoint().unwrap();
        assert!(committer.checkpoint_first_failure.is_none());
    }

    #[tokio::test]
    async fn test_run_saves_and_stops_on_cancel() {
        let s = setup(PersistenceMode::Timer);
        s.registry.commit(s.id, "default", 4).unwrap();
        let mut committer = committer(&s, PersistenceMode::Timer, Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let task = tokio::spawn(async move { committer.run(stop).await });

        for _ in 0..100 {
            if s.persister.save_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(s.persister.save_count(), 1);
        assert!(!s.registry.is_dirty());
    }
}
