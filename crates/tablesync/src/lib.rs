//! tablesync - concurrent table-forest sync scheduler
//!
//! Walks a forest of table definitions with a pluggable client, resolves each
//! table into rows (and every relation once per parent row), and streams the
//! rows out as per-table Arrow record batches.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Scheduler                               │
//! │  validate forest, MigrateTable per table, pick a walk strategy  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      Walk Strategies                            │
//! │  ├── dfs / round-robin / shuffle   (task per table invocation)  │
//! │  └── random-queue / priority-queue (worker pool + idle signal)  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Concurrency Limits     per-depth, global resource, per pair    │
//! │  Resolver Pipeline      table → pre hook → columns → post hook  │
//! │  Metrics                resources / errors / panics, durations  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          Batcher                                │
//! │  per-table workers → RecordBatch on rows / bytes / timeout      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use tablesync::prelude::*;
//!
//! let tables: Tables = vec![
//!     Table::new("accounts")
//!         .with_column(Column::new("id", ColumnType::Int64).primary_key())
//!         .with_resolver(StaticResolver::new(vec![json!({"id": 1})]))
//!         .with_relation(Table::new("users").with_resolver(users_resolver)),
//! ]
//! .into();
//!
//! let config = SchedulerConfig::default().with_strategy(Strategy::RoundRobin);
//! let scheduler = Scheduler::new(config)?;
//!
//! let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//! tokio::spawn(async move {
//!     while let Some(message) = rx.recv().await {
//!         // write message to the destination
//!     }
//! });
//! let summary = scheduler.sync(client, &tables, tx).await?;
//! ```

pub mod batcher;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod scheduler;
pub mod schema;
pub mod telemetry;
pub mod testing;

pub use batcher::Batcher;
pub use config::{BatchSettings, SchedulerConfig, Shard};
pub use error::{ResolverError, ResolverResult, Result, SyncError, ValidationError};
pub use message::SyncMessage;
pub use metrics::{Metrics, MetricsSnapshot, Selector};
pub use scheduler::{Scheduler, Strategy, SyncSummary, WorkUnit};
pub use schema::{Client, ClientRef, Column, ColumnType, Resource, Table, TableResolver, Tables};

// Re-export commonly used dependencies for resolver implementations
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;

/// Everything needed to declare tables and run a sync
pub mod prelude {
    pub use crate::config::{BatchSettings, SchedulerConfig, Shard};
    pub use crate::error::{ResolverError, ResolverResult, SyncError};
    pub use crate::message::SyncMessage;
    pub use crate::scheduler::{Scheduler, Strategy, SyncSummary};
    pub use crate::schema::{
        Client, ClientRef, Column, ColumnResolver, ColumnType, FnColumnResolver, FnResolver,
        FnResourceHook, ItemSender, ParentColumnResolver, PathResolver, Resource, ResourceHook,
        StaticResolver, Table, TableResolver, Tables,
    };
    pub use async_trait::async_trait;
    pub use serde_json::json;
    pub use tokio_util::sync::CancellationToken;
}
