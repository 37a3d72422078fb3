// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O failure on a file that is already tracked. Never recovered per file.
    #[error("IO error on {path:?}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Offset bookkeeping is inconsistent. Continuing would duplicate or lose records.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Channel send error")]
    ChannelSend,
}

impl Error {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::InvariantViolation(msg.into())
    }

    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::FileIo {
            path: path.into(),
            source,
        }
    }

    /// Whether the process must stop rather than skip the current file.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Watcher(_) | Error::ChannelSend)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::invariant("bad commit").is_fatal());
        assert!(Error::file_io("/tmp/a.log", std::io::Error::other("eio")).is_fatal());
        assert!(Error::Sink("closed".to_string()).is_fatal());
        assert!(!Error::Watcher("overflow".to_string()).is_fatal());
        assert!(!Error::ChannelSend.is_fatal());
    }

    #[test]
    fn test_file_io_names_path() {
        let err = Error::file_io("/var/log/app.log", std::io::Error::other("eio"));
        assert!(err.to_string().contains("/var/log/app.log"));
    }
}
