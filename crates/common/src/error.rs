use thiserror::Error;

/// Canonical PQ error taxonomy used across crates.
///
/// Classification guidance:
/// - [`PqError::Execution`]: a storage adapter failed while running an operator
/// - [`PqError::Overloaded`]: a storage unit's backlog ceiling was exceeded; the
///   task was rejected immediately, never queued
/// - [`PqError::Unavailable`]: the target storage is blocked by the liveness
///   protocol or has been removed from the cluster
/// - [`PqError::Network`]: transient consensus-transport failure; callers retry
/// - [`PqError::VoteExpired`]: the vote round already closed; callers abandon
/// - [`PqError::Canceled`]: the originating session was closed before dispatch
/// - [`PqError::InvalidConfig`]: configuration/registry contract violations
/// - [`PqError::Io`]: raw filesystem/network IO failures from std APIs
#[derive(Debug, Error)]
pub enum PqError {
    /// Invalid or inconsistent configuration state.
    ///
    /// Examples:
    /// - unknown fault-tolerance policy name
    /// - worker pool size or backlog ceiling of zero
    /// - adapter registry lookup for an unregistered engine kind
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Runtime execution failures inside a storage adapter or row stream.
    ///
    /// Examples:
    /// - adapter error while running a project/insert/delete operator
    /// - row stream failing mid-iteration
    /// - header mismatch when stitching partial tables
    #[error("execution error: {0}")]
    Execution(String),

    /// Backpressure rejection: the unit's in-flight task count exceeded the
    /// configured ceiling.
    #[error("too many pending tasks for storage unit {unit}: {pending} in flight")]
    Overloaded {
        /// Storage unit whose backlog ceiling was hit.
        unit: String,
        /// In-flight task count observed at rejection time.
        pending: usize,
    },

    /// Target storage is blocked or removed; dispatch fails fast instead of
    /// hanging on a dead connector.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Transient consensus-transport failure. Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// The proposal round this vote was cast for has already closed.
    #[error("vote round expired: {0}")]
    VoteExpired(String),

    /// The originating session was closed before the task reached a worker.
    #[error("session canceled: {0}")]
    Canceled(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for behavior intentionally outside this subsystem.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl PqError {
    /// True for failures the caller may retry after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PqError::Network(_) | PqError::Overloaded { .. })
    }
}

/// Standard PQ result alias.
pub type Result<T> = std::result::Result<T, PqError>;
