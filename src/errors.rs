// ABOUTME: Error taxonomy shared by the protocol core and the database adapters
// ABOUTME: No retries anywhere - the first failing worker aborts the whole run

use thiserror::Error;

/// Failures that can tear down a worker pair or the whole run.
///
/// There is deliberately no retry machinery behind any of these: a fresh
/// end-to-end run is cheaper than trying to resume partial protocol state.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed frame, unknown verb or type tag, version mismatch, or EOF
    /// in the middle of a frame. Fatal to the worker pair.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The schema comparison on the leader found structural differences.
    /// Fatal to the run.
    #[error("schema mismatch:\n{0}")]
    SchemaMismatch(String),

    /// Propagated from a database adapter.
    #[error("database error: {0}")]
    Database(Box<dyn std::error::Error + Send + Sync>),

    /// Raised by `SyncQueue::check_aborted` in workers that did not fail
    /// themselves; propagation only, never a root cause.
    #[error("aborted after a failure in another worker")]
    Aborted,

    /// Pipe or socket failure. Fatal to the worker pair.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn protocol(message: impl Into<String>) -> Self {
        SyncError::Protocol(message.into())
    }

    pub fn database(message: impl Into<String>) -> Self {
        let message: String = message.into();
        SyncError::Database(message.into())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
