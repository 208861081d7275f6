//! Scheduler - walks a table forest and streams its rows as record batches
//!
//! ```text
//! Scheduler::sync
//!   ├── validate forest (empty, depth, unique names)
//!   ├── MigrateTable × every table
//!   ├── root units: multiplex → order by strategy → shard
//!   ├── walker task ─────────────┐  dfs / round-robin / shuffle: task tree
//!   │                            │  random-queue / priority-queue: worker pool
//!   │                    resources (mpsc)
//!   │                            ▼
//!   └── Batcher ──▶ Insert batches on the output channel
//! ```
//!
//! Resolver failures never fail a sync; they are counted in [`Metrics`] and
//! reported as [`SyncMessage::Error`]. Only configuration problems,
//! cancellation and a closed output channel end it with an error. Every task
//! runs under a sync-scoped child of the caller's token, which a failed
//! output send also trips.

mod dfs;
mod limits;
mod pipeline;
mod queue;
mod strategy;
mod work;

pub use strategy::Strategy;
pub use work::{multiplex_clients, shard_items, WorkUnit};

use crate::batcher::Batcher;
use crate::config::SchedulerConfig;
use crate::error::{Result, SyncError};
use crate::message::SyncMessage;
use crate::metrics::Metrics;
use crate::schema::{ClientRef, Tables};
use pipeline::SyncContext;
use queue::{PriorityQueue, RandomQueue, WorkQueue};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Resolved resources buffered between the walker and the batcher
const RESOURCE_BUFFER: usize = 1024;

/// Outcome of a completed sync
#[derive(Debug, Clone)]
pub struct SyncSummary {
    pub metrics: Arc<Metrics>,
    pub duration: Duration,
}

impl SyncSummary {
    pub fn total_resources(&self) -> u64 {
        self.metrics.total_resources()
    }

    pub fn total_errors(&self) -> u64 {
        self.metrics.total_errors()
    }

    pub fn total_panics(&self) -> u64 {
        self.metrics.total_panics()
    }
}

/// Sync facade
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a scheduler, rejecting an invalid configuration
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate_config()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Sync `tables` using `client`, sending every message to `output`
    pub async fn sync(
        &self,
        client: ClientRef,
        tables: &Tables,
        output: mpsc::Sender<SyncMessage>,
    ) -> Result<SyncSummary> {
        self.sync_with_cancellation(client, tables, output, CancellationToken::new())
            .await
    }

    /// Like [`sync`](Self::sync), stopping early once `cancel` fires.
    ///
    /// A cancelled sync returns [`SyncError::Cancelled`] after every task it
    /// started has wound down. Rows not yet flushed are lost.
    pub async fn sync_with_cancellation(
        &self,
        client: ClientRef,
        tables: &Tables,
        output: mpsc::Sender<SyncMessage>,
        cancel: CancellationToken,
    ) -> Result<SyncSummary> {
        let started = Instant::now();
        self.validate_tables(tables)?;

        for table in tables.flatten() {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(SyncError::Cancelled),
                sent = output.send(SyncMessage::MigrateTable { table }) => {
                    sent.map_err(|_| SyncError::OutputClosed)?;
                }
            }
        }

        let roots = work::root_clients(tables, &client);
        let mut metrics = Metrics::new();
        for (table, clients) in &roots {
            metrics.init_with_clients(table, clients);
        }
        let metrics = Arc::new(metrics);

        let units = shard_items(
            work::ordered_roots(self.config.strategy, &roots),
            self.config.shard,
        );
        info!(
            strategy = %self.config.strategy,
            tables = tables.len(),
            units = units.len(),
            shard = ?self.config.shard.map(|s| s.to_string()),
            "Starting sync"
        );

        let sync_cancel = cancel.child_token();
        let (resource_tx, mut resource_rx) = mpsc::channel(RESOURCE_BUFFER);
        let ctx = Arc::new(SyncContext::new(
            &self.config,
            Arc::clone(&metrics),
            resource_tx,
            output.clone(),
            sync_cancel.clone(),
        ));

        let walker = match self.config.strategy {
            Strategy::Dfs | Strategy::RoundRobin | Strategy::Shuffle => {
                tokio::spawn(dfs::run(ctx, units))
            }
            Strategy::RandomQueue | Strategy::PriorityQueue => {
                let work_queue: Arc<dyn WorkQueue> = match self.config.strategy {
                    Strategy::RandomQueue => {
                        Arc::new(RandomQueue::new(work::shuffle_seed(&roots)))
                    }
                    _ => Arc::new(PriorityQueue::new()),
                };
                tokio::spawn(queue::run(ctx, work_queue, units, self.config.queue_workers))
            }
        };

        let progress_stop = sync_cancel.child_token();
        let progress = self.config.metrics_log_interval().map(|period| {
            tokio::spawn(log_progress(
                Arc::clone(&metrics),
                period,
                progress_stop.clone(),
            ))
        });

        // The channel closes once the walker and all its tasks are done
        let batcher = Batcher::new(self.config.batch.clone(), output, sync_cancel.clone());
        while let Some(resource) = resource_rx.recv().await {
            batcher.process(resource).await;
        }
        batcher.close().await;

        if let Err(e) = walker.await {
            error!(error = %e, "Walker task failed");
        }
        metrics.end_all();
        progress_stop.cancel();
        if let Some(progress) = progress {
            let _ = progress.await;
        }

        if cancel.is_cancelled() {
            warn!(resources = metrics.total_resources(), "Sync cancelled");
            return Err(SyncError::Cancelled);
        }
        if sync_cancel.is_cancelled() {
            warn!(
                resources = metrics.total_resources(),
                "Output channel closed, sync stopped"
            );
            return Err(SyncError::OutputClosed);
        }

        let duration = started.elapsed();
        info!(
            resources = metrics.total_resources(),
            errors = metrics.total_errors(),
            panics = metrics.total_panics(),
            duration_ms = duration.as_millis() as u64,
            "Sync finished"
        );
        Ok(SyncSummary { metrics, duration })
    }

    fn validate_tables(&self, tables: &Tables) -> Result<()> {
        if tables.is_empty() {
            return Err(SyncError::NoTables);
        }
        let depth = tables.max_depth();
        if depth > self.config.max_depth {
            return Err(SyncError::MaxDepthExceeded {
                depth,
                max: self.config.max_depth,
            });
        }
        let mut names = HashSet::new();
        for table in tables.flatten() {
            if !names.insert(table.name.clone()) {
                return Err(SyncError::DuplicateTable(table.name.clone()));
            }
        }
        Ok(())
    }
}

/// Log the pairs still in progress every `period` until `stop` fires
async fn log_progress(metrics: Arc<Metrics>, period: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                let pending = metrics.in_progress();
                if pending.is_empty() {
                    debug!("No table in progress");
                    continue;
                }
                let pairs: Vec<String> = pending
                    .iter()
                    .map(|(table, client)| format!("{table}/{client}"))
                    .collect();
                info!(
                    in_progress = pending.len(),
                    resources = metrics.total_resources(),
                    pairs = %pairs.join(","),
                    "Sync in progress"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnType, StaticResolver, Table};
    use crate::testing::{collect_output, CountingResolver, TestClient};
    use serde_json::json;

    fn chain(depth: usize, resolver: &CountingResolver) -> Table {
        let mut table = Table::new(format!("t{depth}")).with_resolver(resolver.clone());
        if depth > 1 {
            table = table.with_relation(chain(depth - 1, resolver));
        }
        table
    }

    #[tokio::test]
    async fn test_empty_forest_is_rejected() {
        let (tx, mut rx) = mpsc::channel(8);
        let err = Scheduler::default()
            .sync(TestClient::arc("c1"), &Tables::default(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoTables));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_depth_checked_before_any_resolver() {
        let resolver = CountingResolver::new(vec![json!({})]);
        let tables: Tables = vec![chain(5, &resolver)].into();
        let (tx, mut rx) = mpsc::channel(8);

        let err = Scheduler::default()
            .sync(TestClient::arc("c1"), &tables, tx)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MaxDepthExceeded { depth: 5, max: 4 }));
        assert!(err.is_config());
        assert_eq!(resolver.calls(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = SchedulerConfig::default().with_max_depth(0);
        assert!(Scheduler::new(config).unwrap_err().is_config());
    }

    #[tokio::test]
    async fn test_closed_output() {
        let tables: Tables = vec![Table::new("t")].into();
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let err = Scheduler::default()
            .sync(TestClient::arc("c1"), &tables, tx)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::OutputClosed));
    }

    #[tokio::test]
    async fn test_duplicate_table_names_rejected() {
        let resolver = CountingResolver::new(vec![json!({})]);
        let tables: Tables = vec![
            Table::new("accounts")
                .with_relation(Table::new("users").with_resolver(resolver.clone())),
            Table::new("groups")
                .with_relation(Table::new("users").with_resolver(resolver.clone())),
        ]
        .into();
        let (tx, mut rx) = mpsc::channel(8);

        let err = Scheduler::default()
            .sync(TestClient::arc("c1"), &tables, tx)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::DuplicateTable(ref name) if name == "users"));
        assert!(err.is_config());
        assert_eq!(resolver.calls(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_migrate_messages_come_first() {
        let tables: Tables = vec![
            Table::new("a")
                .with_column(Column::new("id", ColumnType::Int64))
                .with_resolver(StaticResolver::new(vec![json!({"id": 1})]))
                .with_relation(Table::new("a_child")),
            Table::new("b"),
        ]
        .into();
        let (tx, rx) = mpsc::channel(64);
        let collector = tokio::spawn(collect_output(rx));

        let summary = Scheduler::default()
            .sync(TestClient::arc("c1"), &tables, tx)
            .await
            .unwrap();
        let output = collector.await.unwrap();

        assert_eq!(output.migrated, vec!["a", "a_child", "b"]);
        assert_eq!(output.first_data_index, Some(3));
        assert_eq!(summary.total_resources(), 1);
        assert!(summary.metrics.in_progress().is_empty());
    }
}
