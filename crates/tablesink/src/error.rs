//! Sink error taxonomy
//!
//! Each failure carries enough type information for the consumer loop to pick a policy
//! (see [`Disposition`]) instead of catching everything and rolling back blindly.

use thiserror::Error;

/// Result type alias for sink operations
pub type Result<T> = std::result::Result<T, SinkError>;

/// PostgreSQL SQLSTATE codes the sink reacts to
pub(crate) mod sqlstate {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const DUPLICATE_TABLE: &str = "42P07";
    pub const UNDEFINED_TABLE: &str = "42P01";
    pub const UNDEFINED_COLUMN: &str = "42703";
    pub const DUPLICATE_COLUMN: &str = "42701";
    pub const WRONG_OBJECT_TYPE: &str = "42809";
    pub const DATATYPE_MISMATCH: &str = "42804";
    pub const ADMIN_SHUTDOWN: &str = "57P01";
    pub const CRASH_SHUTDOWN: &str = "57P02";
    pub const CANNOT_CONNECT_NOW: &str = "57P03";
    pub const QUERY_CANCELED: &str = "57014";
    pub const LOCK_NOT_AVAILABLE: &str = "55P03";

    /// Class 08: connection exception
    pub const CONNECTION_EXCEPTION_CLASS: &str = "08";
    /// Class 53: insufficient resources (disk full, out of memory, too many connections)
    pub const INSUFFICIENT_RESOURCES_CLASS: &str = "53";
    /// Class 40: transaction rollback (deadlock, serialization failure)
    pub const TRANSACTION_ROLLBACK_CLASS: &str = "40";
}

/// What the consumer loop should do with a message that failed with this error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Never reached the store; acknowledge and move on
    Skip,
    /// Rolled back; acknowledge and move on (no dead-letter destination exists)
    Drop,
    /// Leave unacknowledged, back off, and reprocess the same message
    Retry,
    /// Stop the process so a supervisor can restart it
    Fatal,
}

/// Sink error types
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Decode failure: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Row {row} has {actual} values but {expected} columns were declared")]
    ArityMismatch {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Schema conflict on relation {relation}: {source}")]
    SchemaConflict {
        relation: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[source] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(#[source] sqlx::Error),

    #[error("Stream unavailable: {0}")]
    StreamUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SinkError {
    /// Classify a store error raised while working on `relation`
    pub fn from_store(relation: &str, err: sqlx::Error) -> Self {
        if is_transient_error(&err) {
            return SinkError::StorageUnavailable(err);
        }

        let conflict = sqlstate_of(&err).is_some_and(|code| {
            matches!(
                code.as_str(),
                sqlstate::UNDEFINED_TABLE
                    | sqlstate::UNDEFINED_COLUMN
                    | sqlstate::DUPLICATE_COLUMN
                    | sqlstate::WRONG_OBJECT_TYPE
                    | sqlstate::DATATYPE_MISMATCH
            )
        });

        if conflict {
            SinkError::SchemaConflict {
                relation: relation.to_string(),
                source: err,
            }
        } else {
            SinkError::Storage(err)
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            SinkError::Malformed(_) | SinkError::Decode(_) => Disposition::Skip,
            SinkError::ArityMismatch { .. }
            | SinkError::SchemaConflict { .. }
            | SinkError::Storage(_) => Disposition::Drop,
            SinkError::StorageUnavailable(_) | SinkError::StreamUnavailable(_) => {
                Disposition::Retry
            },
            SinkError::Config(_) => Disposition::Fatal,
        }
    }

    /// Short stable label for logs and statistics
    pub fn kind(&self) -> &'static str {
        match self {
            SinkError::Malformed(_) => "malformed",
            SinkError::Decode(_) => "decode",
            SinkError::ArityMismatch { .. } => "arity_mismatch",
            SinkError::SchemaConflict { .. } => "schema_conflict",
            SinkError::StorageUnavailable(_) => "storage_unavailable",
            SinkError::Storage(_) => "storage",
            SinkError::StreamUnavailable(_) => "stream_unavailable",
            SinkError::Config(_) => "config",
        }
    }
}

/// SQLSTATE of a database-side error, if any
pub(crate) fn sqlstate_of(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// True when the store could not be reached, dropped the session, or aborted the
/// statement for a reason that may clear on its own (timeouts, lock contention)
pub(crate) fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(_) => sqlstate_of(err).is_some_and(|code| {
            code.starts_with(sqlstate::CONNECTION_EXCEPTION_CLASS)
                || code.starts_with(sqlstate::INSUFFICIENT_RESOURCES_CLASS)
                || code.starts_with(sqlstate::TRANSACTION_ROLLBACK_CLASS)
                || matches!(
                    code.as_str(),
                    sqlstate::ADMIN_SHUTDOWN
                        | sqlstate::CRASH_SHUTDOWN
                        | sqlstate::CANNOT_CONNECT_NOW
                        | sqlstate::QUERY_CANCELED
                        | sqlstate::LOCK_NOT_AVAILABLE
                )
        }),
        _ => false,
    }
}
