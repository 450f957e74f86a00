//! Kiln broker error abstractions.

pub use kiln_core::BrokerError;

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from store";

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;

/// Extract the typed broker error from an error chain, if present.
pub fn broker_error(err: &anyhow::Error) -> Option<&BrokerError> {
    err.downcast_ref::<BrokerError>()
}
