//! Worker-pool dispatch over a shared queue
//!
//! ```text
//!            push roots / child units
//!   ┌──────────────────────────────────────┐
//!   ▼                                      │
//! WorkQueue ──feeder──▶ jobs (MPMC) ──▶ worker × N ──▶ run_table
//!   ▲                                      │
//!   └──────── ActiveWorkSignal ◀───────────┘
//! ```
//!
//! The feeder stops once the queue is empty and no unit is active.

mod priority;
mod random;
mod signal;

pub(crate) use priority::PriorityQueue;
pub(crate) use random::RandomQueue;
pub(crate) use signal::ActiveWorkSignal;

use super::pipeline::{run_table, SyncContext};
use super::work::WorkUnit;
use crate::error::Result;
use crate::schema::Resource;
use crate::telemetry::table_span;
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinSet;
use tracing::{debug, error, Instrument};

/// Shared queue of pending table invocations
pub(crate) trait WorkQueue: Send + Sync {
    fn push(&self, unit: WorkUnit);

    fn pop(&self) -> Option<WorkUnit>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolve `roots` and everything below them with `workers` tasks
pub(crate) async fn run(
    ctx: Arc<SyncContext>,
    queue: Arc<dyn WorkQueue>,
    roots: Vec<WorkUnit>,
    workers: usize,
) {
    for unit in roots {
        queue.push(unit);
    }

    let signal = Arc::new(ActiveWorkSignal::new());
    let (jobs_tx, jobs_rx) = async_channel::bounded::<WorkUnit>(1);
    let mut pool = JoinSet::new();
    for _ in 0..workers.max(1) {
        pool.spawn(worker(
            Arc::clone(&ctx),
            Arc::clone(&queue),
            Arc::clone(&signal),
            jobs_rx.clone(),
        ));
    }
    drop(jobs_rx);

    loop {
        let notified = signal.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(unit) = queue.pop() {
            signal.add();
            let sent = tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => false,
                sent = jobs_tx.send(unit) => sent.is_ok(),
            };
            if !sent {
                signal.done();
                break;
            }
            continue;
        }

        if signal.is_idle() {
            break;
        }

        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => break,
            () = &mut notified => {}
        }
    }

    debug!(pending = queue.len(), active = signal.active(), "Queue dispatcher stopping");
    jobs_tx.close();
    while let Some(joined) = pool.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Queue worker failed");
        }
    }
}

async fn worker(
    ctx: Arc<SyncContext>,
    queue: Arc<dyn WorkQueue>,
    signal: Arc<ActiveWorkSignal>,
    jobs: async_channel::Receiver<WorkUnit>,
) {
    while let Ok(unit) = jobs.recv().await {
        process(&ctx, &queue, &signal, unit).await;
        signal.done();
    }
}

/// Permits a unit holds while it runs: the parent pair's nested permit for
/// child units, then the table permit for the unit's depth
async fn unit_permits(
    ctx: &SyncContext,
    unit: &WorkUnit,
) -> Result<(Option<OwnedSemaphorePermit>, OwnedSemaphorePermit)> {
    let nested = match &unit.parent {
        Some(parent) => Some(
            ctx.limits
                .acquire_nested(&parent.table().name, unit.client.id(), &ctx.cancel)
                .await?,
        ),
        None => None,
    };
    let table = ctx
        .limits
        .acquire_table(unit.table.level(), &ctx.cancel)
        .await?;
    Ok((nested, table))
}

/// Resolve one unit, queueing a child unit per relation of every row
async fn process(
    ctx: &Arc<SyncContext>,
    queue: &Arc<dyn WorkQueue>,
    signal: &Arc<ActiveWorkSignal>,
    unit: WorkUnit,
) {
    let Ok(permits) = unit_permits(ctx, &unit).await else {
        debug!(table = %unit.table.name, "Sync cancelled, skipping queued unit");
        return;
    };
    let span = table_span(&unit.table.name, unit.client.id(), unit.table.level());
    let selector = ctx.metrics.selector(&unit.table.name, unit.client.id());
    selector.start();

    let queue = Arc::clone(queue);
    let signal = Arc::clone(signal);
    let parent = unit.clone();
    let enqueue_relations = move |resource: Arc<Resource>| {
        for relation in &parent.table.relations {
            queue.push(WorkUnit::child(
                Arc::clone(relation),
                Arc::clone(&parent.client),
                Arc::clone(&resource),
            ));
        }
        if !parent.table.relations.is_empty() {
            signal.notify();
        }
        async {}.boxed()
    };

    run_table(ctx, &unit, &selector, enqueue_relations)
        .instrument(span)
        .await;
    drop(permits);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::metrics::Metrics;
    use crate::schema::{Column, ColumnType, StaticResolver, Table};
    use crate::testing::TestClient;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn forest() -> Arc<Table> {
        Table::new("parent")
            .with_column(Column::new("id", ColumnType::Int64))
            .with_resolver(StaticResolver::new((0..10).map(|i| json!({"id": i}))))
            .with_relation(
                Table::new("child")
                    .with_column(Column::new("id", ColumnType::Int64))
                    .with_resolver(StaticResolver::new((0..3).map(|i| json!({"id": i})))),
            )
            .build()
    }

    async fn run_with(queue: Arc<dyn WorkQueue>, workers: usize) -> (Arc<Metrics>, usize) {
        let table = forest();
        let mut metrics = Metrics::new();
        metrics.init_with_clients(&table, &[TestClient::arc("c1")]);
        let metrics = Arc::new(metrics);

        let (resource_tx, mut resource_rx) = mpsc::channel(1024);
        let (output_tx, _output_rx) = mpsc::channel(16);
        let ctx = Arc::new(SyncContext::new(
            &SchedulerConfig::default(),
            Arc::clone(&metrics),
            resource_tx,
            output_tx,
            CancellationToken::new(),
        ));

        let roots = vec![WorkUnit::root(table, TestClient::arc("c1"))];
        run(ctx, queue, roots, workers).await;

        let mut emitted = 0;
        while resource_rx.recv().await.is_some() {
            emitted += 1;
        }
        (metrics, emitted)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_random_queue_resolves_everything() {
        let (metrics, emitted) = run_with(Arc::new(RandomQueue::new(1)), 8).await;
        assert_eq!(metrics.resources("parent", "c1"), 10);
        assert_eq!(metrics.resources("child", "c1"), 30);
        assert_eq!(emitted, 40);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_priority_queue_single_worker() {
        let (metrics, emitted) = run_with(Arc::new(PriorityQueue::new()), 1).await;
        assert_eq!(metrics.resources("child", "c1"), 30);
        assert_eq!(emitted, 40);
    }
}
