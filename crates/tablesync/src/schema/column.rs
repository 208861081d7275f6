//! Column definitions

use super::client::ClientRef;
use super::resource::Resource;
use crate::error::ResolverResult;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Logical column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    Int64,
    Float64,
    Utf8,
    /// UTC timestamp with microsecond precision
    Timestamp,
    /// Arbitrary JSON, stored as text
    Json,
    Uuid,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Boolean => "boolean",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::Utf8 => "utf8",
            Self::Timestamp => "timestamp",
            Self::Json => "json",
            Self::Uuid => "uuid",
        };
        f.write_str(name)
    }
}

/// Resolves the value of one column for one resource
#[async_trait]
pub trait ColumnResolver: Send + Sync {
    async fn resolve(
        &self,
        client: &ClientRef,
        resource: &mut Resource,
        column: &Column,
    ) -> ResolverResult<()>;
}

/// A table column
#[derive(Clone)]
pub struct Column {
    pub name: String,
    pub description: String,
    pub column_type: ColumnType,
    /// Explicit resolver; `None` falls back to [`default_value`]
    pub resolver: Option<Arc<dyn ColumnResolver>>,
    pub primary_key: bool,
    pub primary_key_component: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            column_type,
            resolver: None,
            primary_key: false,
            primary_key_component: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_resolver(mut self, resolver: impl ColumnResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Mark as primary key. Rows with a null value here are dropped.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Mark as primary-key component. Components take part in the
    /// deterministic identifier; a null value only warns.
    pub fn primary_key_component(mut self) -> Self {
        self.primary_key_component = true;
        self
    }
}

impl fmt::Debug for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.name)
            .field("column_type", &self.column_type)
            .field("has_resolver", &self.resolver.is_some())
            .field("primary_key", &self.primary_key)
            .field("primary_key_component", &self.primary_key_component)
            .finish()
    }
}

/// Default extraction: the item field whose name matches the column name,
/// ignoring case and underscores (`TestColumn`, `testColumn` and
/// `test_column` all match `test_column`). Missing fields yield null.
pub fn default_value(item: &Value, column_name: &str) -> Value {
    let Some(fields) = item.as_object() else {
        return Value::Null;
    };
    if let Some(value) = fields.get(column_name) {
        return value.clone();
    }
    let wanted = normalize(column_name);
    fields
        .iter()
        .find(|(key, _)| normalize(key) == wanted)
        .map(|(_, value)| value.clone())
        .unwrap_or(Value::Null)
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}
