//! Resolved rows

use super::table::Table;
use crate::codec;
use crate::error::{ResolverError, ResolverResult, ValidationError};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// One resolved row of a [`Table`].
///
/// Built by the resolver pipeline, handed to the batcher once, then dropped.
#[derive(Clone)]
pub struct Resource {
    table: Arc<Table>,
    parent: Option<Arc<Resource>>,
    item: Value,
    values: Vec<Value>,
    id: Option<Uuid>,
}

impl Resource {
    pub fn new(table: Arc<Table>, parent: Option<Arc<Resource>>, item: Value) -> Self {
        let values = vec![Value::Null; table.columns.len()];
        Self {
            table,
            parent,
            item,
            values,
            id: None,
        }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn parent(&self) -> Option<&Arc<Resource>> {
        self.parent.as_ref()
    }

    /// Raw item returned by the table resolver
    pub fn item(&self) -> &Value {
        &self.item
    }

    pub fn item_mut(&mut self) -> &mut Value {
        &mut self.item
    }

    /// Resolved values, in column order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn id(&self) -> Option<Uuid> {
        self.id
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.table
            .column_index(column)
            .map(|index| &self.values[index])
    }

    /// Set a column value, coercing it to the column type
    pub fn set(&mut self, column: &str, value: Value) -> ResolverResult<()> {
        let index = self
            .table
            .column_index(column)
            .ok_or_else(|| ResolverError::UnknownColumn(column.to_string()))?;
        let column_type = self.table.columns[index].column_type;
        self.values[index] =
            codec::coerce(column_type, value).map_err(|e| ResolverError::codec(column, e))?;
        Ok(())
    }

    /// Assign the row identifier.
    ///
    /// Primary-key components, when declared, always give a name-based id.
    /// Otherwise the id is random unless `deterministic` is set and the
    /// table has primary keys.
    pub fn calculate_id(&mut self, deterministic: bool) {
        let components = self.table.primary_key_components();
        if !components.is_empty() {
            self.id = Some(self.name_based_id(components));
            return;
        }
        let keys = self.table.primary_keys();
        if !deterministic || keys.is_empty() {
            self.id = Some(Uuid::new_v4());
            return;
        }
        self.id = Some(self.name_based_id(keys));
    }

    fn name_based_id(&self, mut columns: Vec<&str>) -> Uuid {
        columns.sort_unstable();
        let mut hasher = Sha256::new();
        for column in columns {
            hasher.update(column.as_bytes());
            if let Some(value) = self.get(column) {
                hasher.update(codec::value_text(value).as_bytes());
            }
        }
        Uuid::new_v5(&Uuid::nil(), &hasher.finalize())
    }

    /// Primary-key problems on this row
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let missing = |flag: fn(&super::Column) -> bool| -> Vec<String> {
            self.table
                .columns
                .iter()
                .zip(&self.values)
                .filter(|(column, value)| flag(column) && value.is_null())
                .map(|(column, _)| column.name.clone())
                .collect()
        };

        let keys = missing(|c| c.primary_key);
        if !keys.is_empty() {
            errors.push(ValidationError::MissingPrimaryKeys(keys));
        }
        let components = missing(|c| c.primary_key_component);
        if !components.is_empty() {
            errors.push(ValidationError::MissingPrimaryKeyComponents(components));
        }
        errors
    }

    /// Values as emitted: `_sync_id`, `_sync_parent_id`, then the columns
    pub fn record_values(&self) -> Vec<Value> {
        let mut row = Vec::with_capacity(self.values.len() + 2);
        row.push(uuid_value(self.id));
        row.push(uuid_value(self.parent.as_ref().and_then(|p| p.id)));
        row.extend(self.values.iter().cloned());
        row
    }

    /// Approximate in-memory size of the resolved values
    pub fn estimated_size(&self) -> usize {
        // two lineage uuids
        72 + self.values.iter().map(codec::estimated_size).sum::<usize>()
    }
}

fn uuid_value(id: Option<Uuid>) -> Value {
    id.map(|id| Value::String(id.to_string()))
        .unwrap_or(Value::Null)
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("table", &self.table.name)
            .field("id", &self.id)
            .field("parent_id", &self.parent.as_ref().and_then(|p| p.id))
            .field("values", &self.values)
            .finish()
    }
}
