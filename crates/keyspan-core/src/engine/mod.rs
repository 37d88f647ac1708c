//! Write, cleanup, and scan engines plus their shared retry schedule.

pub mod delete;
pub mod scan;
pub mod write;

use std::thread;
use std::time::Duration;

use tracing::error;

use crate::error::{BackendError, Error};

/// Initial retry delay in milliseconds.
pub const INITIAL_RETRY_DELAY_MS: f64 = 4.0;
/// Multiplier applied after each retry while below the cap.
pub const RETRY_BACKOFF_FACTOR: f64 = 1.2;
/// Retry delay ceiling in milliseconds; no growth beyond.
pub const MAX_RETRY_DELAY_MS: f64 = 1000.0;
/// Total attempt budget for conflict retries and unprocessed-batch
/// resubmits.
pub const MAX_ATTEMPTS: u32 = 11;

/// Capped-exponential backoff. Sleeps happen on the calling thread; this
/// layer performs no internal threading.
pub(crate) struct Backoff {
    delay_ms: f64,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Backoff {
            delay_ms: INITIAL_RETRY_DELAY_MS,
        }
    }

    /// Current delay, advancing the schedule for the next retry.
    fn next_delay(&mut self) -> Duration {
        let current = self.delay_ms;
        if self.delay_ms < MAX_RETRY_DELAY_MS {
            self.delay_ms = (self.delay_ms * RETRY_BACKOFF_FACTOR).min(MAX_RETRY_DELAY_MS);
        }
        Duration::from_secs_f64(current / 1000.0)
    }

    pub(crate) fn sleep(&mut self) {
        thread::sleep(self.next_delay());
    }
}

/// Surface a backend failure.
///
/// Throttling and unexpected backend errors are logged with context and
/// re-raised fatal: this layer does not hide backend unavailability, and
/// applies no backoff of its own here; callers may retry the whole
/// operation.
pub(crate) fn surface_backend_error(e: BackendError) -> Error {
    match &e {
        BackendError::Throttled(_) => error!(error = %e, "backend throttled"),
        BackendError::Unavailable(_) | BackendError::Internal(_) => {
            error!(error = %e, "unexpected backend error")
        }
    }
    Error::Backend(e)
}
