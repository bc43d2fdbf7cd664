use std::time::Duration;
use thiserror::Error;

/// Error raised while loading or mirroring cache state to the backing file.
///
/// Persistence failures are deliberately isolated from the call path: a
/// memoized call never fails because the on-disk mirror could not be written.
/// Instead the failure is logged at warning level and counted in
/// [`MemoStats::persist_errors`](crate::MemoStats::persist_errors), and the
/// in-memory cache stays authoritative.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The backing file could not be opened, read, or appended to.
    #[error("persistence i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// A key/value pair could not be encoded or decoded.
    #[error("persistence encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A rate-limited call was not admitted within the caller-supplied timeout.
///
/// Returned by [`RateLimit::acquire_timeout`](crate::RateLimit::acquire_timeout)
/// and [`AsyncRateLimit::acquire_timeout`](crate::AsyncRateLimit::acquire_timeout).
/// Timing out has no side effects: no concurrency slot stays held and no
/// window timestamp is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("admission not granted within {timeout:?}")]
pub struct AdmissionTimeout {
    /// The timeout the caller supplied.
    pub timeout: Duration,
}
