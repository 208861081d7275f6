//! Messages emitted on the sync output channel

use crate::schema::Table;
use arrow_array::RecordBatch;
use std::sync::Arc;

/// One message on the output channel.
///
/// A sync sends every `MigrateTable` first, then interleaves `Insert` and
/// `Error` messages as tables resolve.
#[derive(Debug, Clone)]
pub enum SyncMessage {
    /// Table declaration, sent once per table before any data
    MigrateTable { table: Arc<Table> },

    /// One flushed batch of rows
    Insert {
        table_name: String,
        record: RecordBatch,
    },

    /// Non-fatal table resolver failure
    Error { table_name: String, error: String },
}

impl SyncMessage {
    /// Name of the table this message refers to
    pub fn table_name(&self) -> &str {
        match self {
            Self::MigrateTable { table } => &table.name,
            Self::Insert { table_name, .. } | Self::Error { table_name, .. } => table_name,
        }
    }

    /// Rows carried by this message
    pub fn num_rows(&self) -> usize {
        match self {
            Self::Insert { record, .. } => record.num_rows(),
            _ => 0,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Self::Insert { .. })
    }
}
