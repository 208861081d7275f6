//! Table definitions and the table forest

use super::client::{ClientRef, Multiplexer};
use super::column::Column;
use super::resource::Resource;
use crate::error::{ResolverError, ResolverResult};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::mpsc;

/// Pages of raw items produced by a table resolver
pub type ItemPage = Vec<Value>;

/// Sending half handed to a [`TableResolver`].
///
/// Sends wait while the pipeline is saturated, so a resolver naturally
/// slows down to the pace of resource resolution.
#[derive(Clone, Debug)]
pub struct ItemSender {
    tx: mpsc::Sender<ItemPage>,
}

impl ItemSender {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<ItemPage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Send a single item
    pub async fn send(&self, item: Value) -> ResolverResult<()> {
        self.send_page(vec![item]).await
    }

    /// Send a page of items
    pub async fn send_page(&self, items: ItemPage) -> ResolverResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.tx
            .send(items)
            .await
            .map_err(|_| ResolverError::Cancelled)
    }

    /// Whether the receiving side has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Produces the raw items of one table invocation.
///
/// `parent` is the parent row for relations and `None` for top-level tables.
/// The resolver returns once all items have been sent.
#[async_trait]
pub trait TableResolver: Send + Sync {
    async fn resolve(
        &self,
        client: ClientRef,
        parent: Option<Arc<Resource>>,
        tx: ItemSender,
    ) -> ResolverResult<()>;
}

/// Hook run on a resource before or after column resolution
#[async_trait]
pub trait ResourceHook: Send + Sync {
    async fn call(&self, client: &ClientRef, resource: &mut Resource) -> ResolverResult<()>;
}

/// A syncable table
pub struct Table {
    pub name: String,
    pub description: String,
    pub columns: Vec<Column>,
    pub relations: Vec<Arc<Table>>,
    pub resolver: Option<Arc<dyn TableResolver>>,
    pub multiplex: Option<Multiplexer>,
    pub pre_resource_resolve: Option<Arc<dyn ResourceHook>>,
    pub post_resource_resolve: Option<Arc<dyn ResourceHook>>,
    parent: OnceLock<Weak<Table>>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            columns: Vec::new(),
            relations: Vec::new(),
            resolver: None,
            multiplex: None,
            pre_resource_resolve: None,
            post_resource_resolve: None,
            parent: OnceLock::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_columns(mut self, columns: impl IntoIterator<Item = Column>) -> Self {
        self.columns.extend(columns);
        self
    }

    pub fn with_resolver(mut self, resolver: impl TableResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn with_multiplex<F>(mut self, multiplex: F) -> Self
    where
        F: Fn(&ClientRef) -> Vec<ClientRef> + Send + Sync + 'static,
    {
        self.multiplex = Some(Arc::new(multiplex));
        self
    }

    pub fn with_pre_resource_resolve(mut self, hook: impl ResourceHook + 'static) -> Self {
        self.pre_resource_resolve = Some(Arc::new(hook));
        self
    }

    pub fn with_post_resource_resolve(mut self, hook: impl ResourceHook + 'static) -> Self {
        self.post_resource_resolve = Some(Arc::new(hook));
        self
    }

    /// Add a child table
    pub fn with_relation(mut self, relation: Table) -> Self {
        self.relations.push(relation.build());
        self
    }

    /// Freeze the table and link its relations back to it
    pub fn build(self) -> Arc<Table> {
        Arc::new_cyclic(|weak| {
            for relation in &self.relations {
                // A relation shared by two parents keeps its first parent
                let _ = relation.parent.set(weak.clone());
            }
            self
        })
    }

    /// Parent table, if this is a relation
    pub fn parent(&self) -> Option<Arc<Table>> {
        self.parent.get().and_then(Weak::upgrade)
    }

    /// Distance from the top-level table (0 for a top-level table)
    pub fn level(&self) -> usize {
        let mut level = 0;
        let mut current = self.parent();
        while let Some(table) = current {
            level += 1;
            current = table.parent();
        }
        level
    }

    /// 1 for a leaf, 1 + deepest relation otherwise
    pub fn depth(&self) -> usize {
        1 + self.relations.iter().map(|r| r.depth()).max().unwrap_or(0)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn primary_keys(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Whether row ids are derived from column values rather than random
    pub fn has_derived_ids(&self, deterministic: bool) -> bool {
        self.columns.iter().any(|c| c.primary_key_component)
            || (deterministic && self.columns.iter().any(|c| c.primary_key))
    }

    pub fn primary_key_components(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key_component)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// This table followed by all descendants, depth first
    pub fn flatten(self: &Arc<Self>) -> Vec<Arc<Table>> {
        let mut out = vec![Arc::clone(self)];
        for relation in &self.relations {
            out.extend(relation.flatten());
        }
        out
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("columns", &self.columns)
            .field("relations", &self.relations)
            .field("has_resolver", &self.resolver.is_some())
            .field("multiplexed", &self.multiplex.is_some())
            .finish()
    }
}

/// A forest of top-level tables
#[derive(Debug, Clone, Default)]
pub struct Tables(Vec<Arc<Table>>);

impl Tables {
    pub fn new(tables: Vec<Arc<Table>>) -> Self {
        Self(tables)
    }

    pub fn push(&mut self, table: Table) {
        self.0.push(table.build());
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<Table>> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every table in the forest, parents before their relations
    pub fn flatten(&self) -> Vec<Arc<Table>> {
        self.0.iter().flat_map(|t| t.flatten()).collect()
    }

    /// Depth of the deepest tree (0 when empty)
    pub fn max_depth(&self) -> usize {
        self.0.iter().map(|t| t.depth()).max().unwrap_or(0)
    }

    /// Find a table anywhere in the forest
    pub fn find(&self, name: &str) -> Option<Arc<Table>> {
        self.flatten().into_iter().find(|t| t.name == name)
    }

    /// Names of every table in the forest
    pub fn names(&self) -> Vec<String> {
        self.flatten().iter().map(|t| t.name.clone()).collect()
    }
}

impl From<Vec<Table>> for Tables {
    fn from(tables: Vec<Table>) -> Self {
        Self(tables.into_iter().map(Table::build).collect())
    }
}

impl FromIterator<Table> for Tables {
    fn from_iter<I: IntoIterator<Item = Table>>(iter: I) -> Self {
        Self(iter.into_iter().map(Table::build).collect())
    }
}

impl<'a> IntoIterator for &'a Tables {
    type Item = &'a Arc<Table>;
    type IntoIter = std::slice::Iter<'a, Arc<Table>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
