//! Testing utilities for table syncs
//!
//! Mock clients, scripted table resolvers and an output collector, so syncs
//! can be exercised without an upstream API.
//!
//! # Example
//!
//! ```rust,ignore
//! use tablesync::testing::*;
//!
//! #[tokio::test]
//! async fn test_my_table() {
//!     let tables: Tables = vec![my_table()].into();
//!     let (tx, rx) = tokio::sync::mpsc::channel(64);
//!     let collector = tokio::spawn(collect_output(rx));
//!
//!     Scheduler::default().sync(TestClient::arc("c1"), &tables, tx).await.unwrap();
//!
//!     let output = collector.await.unwrap();
//!     assert_eq!(output.row_count("my_table"), 3);
//! }
//! ```

use crate::codec::SYNC_ID_COLUMN;
use crate::error::{ResolverError, ResolverResult};
use crate::message::SyncMessage;
use crate::schema::{Client, ClientRef, ItemSender, Resource, TableResolver};
use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type, TimestampMicrosecondType};
use arrow_array::{Array, RecordBatch};
use arrow_schema::DataType;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// Mock Client
// ============================================================================

/// Client identified by a fixed string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestClient {
    id: String,
}

impl TestClient {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Shared handle, ready to pass to a sync
    pub fn arc(id: impl Into<String>) -> ClientRef {
        Arc::new(Self::new(id))
    }
}

impl Client for TestClient {
    fn id(&self) -> &str {
        &self.id
    }
}

// ============================================================================
// Scripted Resolvers
// ============================================================================

/// Table resolver that always panics
#[derive(Debug, Clone, Copy, Default)]
pub struct PanicResolver;

#[async_trait]
impl TableResolver for PanicResolver {
    async fn resolve(
        &self,
        _client: ClientRef,
        _parent: Option<Arc<Resource>>,
        _tx: ItemSender,
    ) -> ResolverResult<()> {
        panic!("table resolver panicked");
    }
}

/// Table resolver that always fails with an API error
#[derive(Debug, Clone)]
pub struct ErrorResolver {
    message: String,
}

impl ErrorResolver {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl TableResolver for ErrorResolver {
    async fn resolve(
        &self,
        _client: ClientRef,
        _parent: Option<Arc<Resource>>,
        _tx: ItemSender,
    ) -> ResolverResult<()> {
        Err(ResolverError::api(self.message.clone()))
    }
}

/// Table resolver returning the same items on every call and recording each
/// invocation. Clones share their counters.
#[derive(Debug, Clone, Default)]
pub struct CountingResolver {
    items: Vec<Value>,
    calls: Arc<AtomicUsize>,
    invocations: Arc<Mutex<Vec<Invocation>>>,
}

/// One recorded [`CountingResolver`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub client: String,
    pub parent_id: Option<Uuid>,
}

impl CountingResolver {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }
}

#[async_trait]
impl TableResolver for CountingResolver {
    async fn resolve(
        &self,
        client: ClientRef,
        parent: Option<Arc<Resource>>,
        tx: ItemSender,
    ) -> ResolverResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.invocations.lock().push(Invocation {
            client: client.id().to_string(),
            parent_id: parent.and_then(|p| p.id()),
        });
        tx.send_page(self.items.clone()).await
    }
}

/// Table resolver that sends its items and then never returns
#[derive(Debug, Clone, Default)]
pub struct HangingResolver {
    items: Vec<Value>,
}

impl HangingResolver {
    pub fn new(items: Vec<Value>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl TableResolver for HangingResolver {
    async fn resolve(
        &self,
        _client: ClientRef,
        _parent: Option<Arc<Resource>>,
        tx: ItemSender,
    ) -> ResolverResult<()> {
        tx.send_page(self.items.clone()).await?;
        std::future::pending::<()>().await;
        Ok(())
    }
}

// ============================================================================
// Output Collector
// ============================================================================

/// Everything a sync sent on its output channel, grouped by table
#[derive(Debug, Default)]
pub struct CollectedOutput {
    /// `MigrateTable` names in arrival order
    pub migrated: Vec<String>,
    /// Insert batches per table in arrival order
    pub batches: BTreeMap<String, Vec<RecordBatch>>,
    /// `(table, error)` per `Error` message
    pub errors: Vec<(String, String)>,
    /// Position of the first non-migrate message
    pub first_data_index: Option<usize>,
}

impl CollectedOutput {
    pub fn row_count(&self, table: &str) -> usize {
        self.batch_sizes(table).iter().sum()
    }

    pub fn total_rows(&self) -> usize {
        self.batches
            .values()
            .flatten()
            .map(RecordBatch::num_rows)
            .sum()
    }

    pub fn batch_sizes(&self, table: &str) -> Vec<usize> {
        self.batches
            .get(table)
            .map(|batches| batches.iter().map(RecordBatch::num_rows).collect())
            .unwrap_or_default()
    }

    /// Values of `column` across every batch of `table`.
    ///
    /// Timestamps come back as microseconds since the epoch.
    pub fn column(&self, table: &str, column: &str) -> Vec<Value> {
        let Some(batches) = self.batches.get(table) else {
            return Vec::new();
        };
        let mut values = Vec::new();
        for batch in batches {
            let Some(array) = batch.column_by_name(column) else {
                continue;
            };
            values.extend((0..array.len()).map(|row| array_value(array.as_ref(), row)));
        }
        values
    }

    /// `_sync_id` values of `table`
    pub fn sync_ids(&self, table: &str) -> Vec<String> {
        self.column(table, SYNC_ID_COLUMN)
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    pub fn error_tables(&self) -> Vec<&str> {
        self.errors.iter().map(|(table, _)| table.as_str()).collect()
    }
}

fn array_value(array: &dyn Array, row: usize) -> Value {
    if array.is_null(row) {
        return Value::Null;
    }
    match array.data_type() {
        DataType::Boolean => Value::Bool(array.as_boolean().value(row)),
        DataType::Int64 => Value::from(array.as_primitive::<Int64Type>().value(row)),
        DataType::Float64 => Value::from(array.as_primitive::<Float64Type>().value(row)),
        DataType::Timestamp(_, _) => {
            Value::from(array.as_primitive::<TimestampMicrosecondType>().value(row))
        }
        DataType::Utf8 => Value::String(array.as_string::<i32>().value(row).to_string()),
        _ => Value::Null,
    }
}

/// Drain `rx` until every sender is gone
pub async fn collect_output(mut rx: mpsc::Receiver<SyncMessage>) -> CollectedOutput {
    let mut output = CollectedOutput::default();
    let mut index = 0;
    while let Some(message) = rx.recv().await {
        match message {
            SyncMessage::MigrateTable { table } => output.migrated.push(table.name.clone()),
            SyncMessage::Insert { table_name, record } => {
                output.first_data_index.get_or_insert(index);
                output.batches.entry(table_name).or_default().push(record);
            }
            SyncMessage::Error { table_name, error } => {
                output.first_data_index.get_or_insert(index);
                output.errors.push((table_name, error));
            }
        }
        index += 1;
    }
    output
}
