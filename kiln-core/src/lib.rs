pub mod error;
pub mod prom;

pub use error::BrokerError;

/// The lock type derivation set: operations which take a WRITE lock on their
/// target deployment. Everything else locks READ.
pub const WRITE_OPERATIONS: &[&str] = &["update", "backup", "restore"];
