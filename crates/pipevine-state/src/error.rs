//! State backend error types.

/// Errors produced by [`StateStore`](crate::StateStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored document or blob failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state store lock poisoned")]
    LockPoisoned,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
