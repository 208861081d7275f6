//! Built-in table and column resolvers

use super::client::ClientRef;
use super::column::{Column, ColumnResolver};
use super::resource::Resource;
use super::table::{ItemPage, ItemSender, ResourceHook, TableResolver};
use crate::error::ResolverResult;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Table resolver returning fixed pages of items
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    pages: Vec<ItemPage>,
}

impl StaticResolver {
    /// All items in a single page
    pub fn new(items: impl IntoIterator<Item = Value>) -> Self {
        Self {
            pages: vec![items.into_iter().collect()],
        }
    }

    pub fn from_pages(pages: Vec<ItemPage>) -> Self {
        Self { pages }
    }
}

#[async_trait]
impl TableResolver for StaticResolver {
    async fn resolve(
        &self,
        _client: ClientRef,
        _parent: Option<Arc<Resource>>,
        tx: ItemSender,
    ) -> ResolverResult<()> {
        for page in &self.pages {
            tx.send_page(page.clone()).await?;
        }
        Ok(())
    }
}

/// Table resolver backed by an async closure returning one page
pub struct FnResolver<F> {
    f: F,
}

impl<F> FnResolver<F> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(ClientRef, Option<Arc<Resource>>) -> Fut + Send + Sync,
        Fut: Future<Output = ResolverResult<ItemPage>> + Send + 'static,
    {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TableResolver for FnResolver<F>
where
    F: Fn(ClientRef, Option<Arc<Resource>>) -> Fut + Send + Sync,
    Fut: Future<Output = ResolverResult<ItemPage>> + Send + 'static,
{
    async fn resolve(
        &self,
        client: ClientRef,
        parent: Option<Arc<Resource>>,
        tx: ItemSender,
    ) -> ResolverResult<()> {
        let items = (self.f)(client, parent).await?;
        tx.send_page(items).await
    }
}

/// Column resolver reading a dotted path (`metadata.owner.id`) from the raw item
#[derive(Debug, Clone)]
pub struct PathResolver {
    path: String,
}

impl PathResolver {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Navigate a dotted path through nested JSON objects.
///
/// Returns `None` if any segment is empty (malformed paths like `"foo..bar"`).
fn get_nested_field<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for key in path.split('.') {
        if key.is_empty() {
            return None;
        }
        current = match current {
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => current.get(key)?,
        };
    }
    Some(current)
}

#[async_trait]
impl ColumnResolver for PathResolver {
    async fn resolve(
        &self,
        _client: &ClientRef,
        resource: &mut Resource,
        column: &Column,
    ) -> ResolverResult<()> {
        let value = get_nested_field(resource.item(), &self.path)
            .cloned()
            .unwrap_or(Value::Null);
        resource.set(&column.name, value)
    }
}

/// Column resolver copying a column of the parent row
#[derive(Debug, Clone)]
pub struct ParentColumnResolver {
    parent_column: String,
}

impl ParentColumnResolver {
    pub fn new(parent_column: impl Into<String>) -> Self {
        Self {
            parent_column: parent_column.into(),
        }
    }
}

#[async_trait]
impl ColumnResolver for ParentColumnResolver {
    async fn resolve(
        &self,
        _client: &ClientRef,
        resource: &mut Resource,
        column: &Column,
    ) -> ResolverResult<()> {
        let value = resource
            .parent()
            .and_then(|parent| parent.get(&self.parent_column))
            .cloned()
            .unwrap_or(Value::Null);
        resource.set(&column.name, value)
    }
}

/// Column resolver computing the value from the resource with a closure
pub struct FnColumnResolver<F> {
    f: F,
}

impl<F> FnColumnResolver<F>
where
    F: Fn(&ClientRef, &Resource) -> ResolverResult<Value> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ColumnResolver for FnColumnResolver<F>
where
    F: Fn(&ClientRef, &Resource) -> ResolverResult<Value> + Send + Sync,
{
    async fn resolve(
        &self,
        client: &ClientRef,
        resource: &mut Resource,
        column: &Column,
    ) -> ResolverResult<()> {
        let value = (self.f)(client, resource)?;
        resource.set(&column.name, value)
    }
}

/// Resource hook backed by a closure
pub struct FnResourceHook<F> {
    f: F,
}

impl<F> FnResourceHook<F>
where
    F: Fn(&ClientRef, &mut Resource) -> ResolverResult<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ResourceHook for FnResourceHook<F>
where
    F: Fn(&ClientRef, &mut Resource) -> ResolverResult<()> + Send + Sync,
{
    async fn call(&self, client: &ClientRef, resource: &mut Resource) -> ResolverResult<()> {
        (self.f)(client, resource)
    }
}
