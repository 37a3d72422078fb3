// SPDX-License-Identifier: Apache-2.0

//! File receiver for tailing log files.
//!
//! Every regular file in one directory is read as a stream of
//! newline-terminated records and handed to a [`RecordSink`].
//!
//! Features:
//! - Inode-based file tracking across renames
//! - Offset persistence for resume after restarts
//! - Truncation detection and deleted file cleanup
//! - Bounded work queue with backpressure towards the watcher

pub mod committer;
pub mod config;
pub mod error;
pub mod input;
pub mod job;
pub mod maintenance;
pub mod metrics;
pub mod persistence;
pub mod receiver;
pub mod registry;
pub mod sink;
pub mod supervisor;
pub mod watcher;
pub mod worker;

pub use committer::{OffsetCommitter, OffsetCommitterConfig};
pub use config::{FileReceiverConfig, PersistenceMode};
pub use error::{Error, Result};
pub use input::{SourceId, get_path_from_file};
pub use job::{Job, WorkItem};
pub use persistence::{
    OffsetFile, OffsetFilePersister, OffsetRecord, PersistedSource, Persister,
};
pub use receiver::FileReceiver;
pub use registry::{JobRegistry, MaintenanceStats};
pub use sink::{DEFAULT_STREAM, RecordRef, RecordSink, WriterSink};
pub use watcher::{DirWatcher, FileWatcher, WatchMode, WatcherConfig};
pub use worker::{ReadLimits, WorkerPool};
