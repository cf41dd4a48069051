//! Failure classification for the consumer's retry machine.
//!
//! Classification is structural: it branches on error types and variants,
//! never on message text. An error nobody classified is Permanent, which
//! drops the message instead of retrying it forever.

use thiserror::Error;

use salesfeed_core::DomainError;
use salesfeed_reports::StoreError;

/// What went wrong while processing one delivery.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The body could not be decoded or failed validation. Retrying can
    /// never fix the message itself.
    #[error("unprocessable message: {0}")]
    Malformed(#[from] DomainError),

    #[error("report persistence failed: {0}")]
    Store(#[from] StoreError),
}

/// The retry machine's verdict on a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// The message can never succeed; acknowledge and drop.
    Poison,
    /// A retry with backoff can plausibly succeed; requeue.
    Transient,
    /// Unclassified; acknowledge and drop rather than loop.
    Permanent,
}

pub fn classify(error: &ProcessError) -> FailureClass {
    match error {
        ProcessError::Malformed(_) => FailureClass::Poison,
        ProcessError::Store(e) if e.is_transient() => FailureClass::Transient,
        ProcessError::Store(_) => FailureClass::Permanent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_is_poison() {
        let error = ProcessError::Malformed(DomainError::validation("bad body"));
        assert_eq!(classify(&error), FailureClass::Poison);
    }

    #[test]
    fn transient_store_failures_retry() {
        for error in [
            StoreError::Timeout("t".into()),
            StoreError::ConnectionReset("r".into()),
            StoreError::Unreachable("u".into()),
        ] {
            assert_eq!(classify(&ProcessError::Store(error)), FailureClass::Transient);
        }
    }

    #[test]
    fn unclassified_store_failure_is_permanent() {
        let error = ProcessError::Store(StoreError::Storage("constraint".into()));
        assert_eq!(classify(&error), FailureClass::Permanent);
    }
}
