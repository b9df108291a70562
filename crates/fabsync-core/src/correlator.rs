//! Correlation of in-flight commissioning-approval requests
//!
//! The bridge answers approval requests asynchronously and may answer late
//! or twice under retries. At most one request is outstanding at a time;
//! responses that do not carry the outstanding id are stale and discarded,
//! and an unanswered request expires after a fixed timeout. The correlator
//! does no scheduling itself: the caller drives `expire` from a timer.

use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// How long the bridge has to answer an approval request.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("approval request {outstanding} is already outstanding")]
    RequestAlreadyOutstanding { outstanding: u64 },
}

/// Result of matching a response against the outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// The response answers the outstanding request, which is now cleared.
    Matched,
    /// Duplicate, delayed, or unsolicited response. Nothing was cleared.
    Stale,
}

#[derive(Debug, Default)]
pub struct RequestCorrelator {
    next_id: u64,
    outstanding: Option<(u64, Instant)>,
    timeout: Option<Duration>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the response timeout. Used by tests; defaults to
    /// [`RESPONSE_TIMEOUT`].
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(RESPONSE_TIMEOUT)
    }

    /// Issue a fresh correlation id, recording `now` as the issue time.
    pub fn issue(&mut self, now: Instant) -> Result<u64, CorrelatorError> {
        if let Some((id, issued_at)) = self.outstanding {
            if now.duration_since(issued_at) <= self.timeout() {
                return Err(CorrelatorError::RequestAlreadyOutstanding { outstanding: id });
            }
            // Expired but never reaped; fall through and replace it.
            debug!(request_id = id, "Replacing expired approval request");
        }
        self.next_id += 1;
        self.outstanding = Some((self.next_id, now));
        Ok(self.next_id)
    }

    /// Match a response id against the outstanding request, clearing it on
    /// success. A stale id clears nothing.
    pub fn match_and_clear(&mut self, candidate: u64) -> Correlation {
        match self.outstanding {
            Some((id, _)) if id == candidate => {
                self.outstanding = None;
                Correlation::Matched
            }
            _ => {
                debug!(candidate, "Discarding stale approval response");
                Correlation::Stale
            }
        }
    }

    /// Reap the outstanding request if its timeout has elapsed, returning
    /// the expired id. No-op when nothing is outstanding or the request is
    /// still within its window.
    pub fn expire(&mut self, now: Instant) -> Option<u64> {
        let (id, issued_at) = self.outstanding?;
        if now.duration_since(issued_at) > self.timeout() {
            self.outstanding = None;
            debug!(request_id = id, "Approval request expired");
            return Some(id);
        }
        None
    }

    /// Drop the outstanding request without waiting for a response.
    pub fn cancel(&mut self) {
        self.outstanding = None;
    }

    pub fn outstanding(&self) -> Option<u64> {
        self.outstanding.map(|(id, _)| id)
    }
}
