//! Error types for tablesync
//!
//! Errors fall into three groups:
//! - [`SyncError`]: fatal to a whole sync (bad configuration, cancellation).
//! - [`ResolverError`]: raised by table, column and resource resolvers. These
//!   are counted in metrics and never abort a sync.
//! - [`ValidationError`]: primary-key problems found on a resolved row.

use crate::codec::CodecError;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Result type alias for resolver code
pub type ResolverResult<T> = std::result::Result<T, ResolverError>;

/// Errors that abort a sync
#[derive(Error, Debug)]
pub enum SyncError {
    /// The table forest was empty
    #[error("no tables to sync")]
    NoTables,

    /// The table forest nests deeper than the configured maximum
    #[error("max depth exceeded: tables nest {depth} levels deep, max depth is {max}")]
    MaxDepthExceeded { depth: usize, max: usize },

    /// Two tables in the forest share a name
    #[error("duplicate table name: {0}")]
    DuplicateTable(String),

    /// Strategy name outside the known set
    #[error("unknown scheduler strategy: {0}")]
    UnknownStrategy(String),

    /// Invalid scheduler configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The sync was cancelled before it finished
    #[error("sync cancelled")]
    Cancelled,

    /// The caller dropped the output receiver
    #[error("output channel closed")]
    OutputClosed,
}

impl SyncError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Configuration errors are raised before any resolver runs
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::NoTables
                | Self::MaxDepthExceeded { .. }
                | Self::DuplicateTable(_)
                | Self::UnknownStrategy(_)
                | Self::Config(_)
        )
    }
}

/// Errors raised while resolving tables, resources and columns
#[derive(Error, Debug)]
pub enum ResolverError {
    /// Upstream API call failed
    #[error("api error: {0}")]
    Api(String),

    /// A resolver addressed a column the table does not declare
    #[error("unknown column: {0}")]
    UnknownColumn(String),

    /// The value could not be coerced to the column type
    #[error("column '{column}': {source}")]
    Codec {
        column: String,
        #[source]
        source: CodecError,
    },

    /// The resolver exceeded its time budget
    #[error("resolver timed out after {0:?}")]
    Timeout(Duration),

    /// The resolver panicked
    #[error("resolver panicked: {0}")]
    Panic(String),

    /// The item channel was closed because the sync is shutting down
    #[error("resolver cancelled")]
    Cancelled,

    /// Generic error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ResolverError {
    /// Create an API error
    pub fn api(msg: impl Into<String>) -> Self {
        Self::Api(msg.into())
    }

    /// Create a codec error for a column
    pub fn codec(column: impl Into<String>, source: CodecError) -> Self {
        Self::Codec {
            column: column.into(),
            source,
        }
    }

    /// Check if this error came from a recovered panic
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panic(_))
    }
}

/// Primary-key validation failures on a resolved row
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Primary-key columns without a value; the row is dropped
    #[error("missing primary key on columns: {}", .0.join(", "))]
    MissingPrimaryKeys(Vec<String>),

    /// Primary-key component columns without a value; the row is kept
    #[error("missing primary key components on columns: {}", .0.join(", "))]
    MissingPrimaryKeyComponents(Vec<String>),

    /// Another row of the same table already produced this primary key
    #[error("duplicate primary key: row id {0} was already emitted")]
    DuplicateId(Uuid),
}

impl ValidationError {
    /// Fatal validation errors drop the row
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingPrimaryKeys(_) | Self::DuplicateId(_))
    }
}
