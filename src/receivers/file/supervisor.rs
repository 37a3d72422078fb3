// SPDX-License-Identifier: Apache-2.0

//! Collects fatal errors from every task and stops the receiver on the first.

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::receivers::file::error::Error;

pub struct Supervisor {
    cancel: CancellationToken,
    first_error: Mutex<Option<Error>>,
}

impl Supervisor {
    /// `cancel` is cancelled on the first fatal error.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            first_error: Mutex::new(None),
        }
    }

    /// Route an error by severity: fatal errors stop the receiver, the rest
    /// are logged.
    pub fn report(&self, context: &str, err: Error) {
        if err.is_fatal() {
            self.fatal(context, err);
        } else {
            warn!(error = %err, "{}", context);
        }
    }

    pub fn fatal(&self, context: &str, err: Error) {
        let mut first = self.first_error.lock();
        if first.is_none() {
            error!(error = %err, "{}, shutting down", context);
            *first = Some(err);
        } else {
            // already stopping, keep the first cause
            warn!(error = %err, "{} after fatal error", context);
        }
        drop(first);
        self.cancel.cancel();
    }

    pub fn has_failed(&self) -> bool {
        self.first_error.lock().is_some()
    }

    pub fn take_error(&self) -> Option<Error> {
        self.first_error.lock().take()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
