//! Kiln error abstractions.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Broker error variants.
///
/// Request-path errors (`AlreadyLocked`, `DeploymentDelayed`) are surfaced
/// synchronously so the API layer can map them to protocol responses.
/// Background pollers contain their errors within their own tick.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The target resource already holds a live lock.
    #[error("resource {resource} is already locked for {operation} since {locked_at}")]
    AlreadyLocked {
        /// The locked resource id, typically an instance guid.
        resource: String,
        /// The operation which holds the lock.
        operation: String,
        /// When the live lock was acquired.
        locked_at: DateTime<Utc>,
    },
    /// Admission was denied; the operation was deferred or must be retried
    /// on the caller's next cycle. Not a failure from the caller's view.
    #[error("operation on deployment '{0}' has been delayed")]
    DeploymentDelayed(String),
    /// A store write failed while queueing an operation. The operation is
    /// NOT durably queued and will not be replayed.
    #[error("error updating operation cache for key '{key}'")]
    CacheUpdateError {
        key: String,
        #[source]
        source: anyhow::Error,
    },
    /// The store's mutual-exclusion primitive could not be acquired within
    /// its bounded timeout. Retryable.
    #[error("lock error: {0}")]
    LockError(String),
    /// A long-running operation exceeded its allowed duration and was
    /// forcibly terminated by the status poller.
    #[error("operation timed out: {0}")]
    OperationTimeout(String),
    /// The requested record does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),
    /// The broker has hit an internal error, but will remain online.
    #[error("internal broker error")]
    Ise(#[source] anyhow::Error),
}

impl BrokerError {
    /// Whether this error indicates the operation may simply be retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AlreadyLocked { .. } | Self::DeploymentDelayed(_) | Self::LockError(_))
    }
}
