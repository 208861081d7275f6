//! Depth-first walker (also runs round-robin and shuffle root orders)
//!
//! Every table invocation is a task; every resolved row spawns one task per
//! relation. A task joins all of its children before it returns, so memory
//! stays proportional to the live part of the tree.

use super::pipeline::{run_table, SyncContext};
use super::work::WorkUnit;
use crate::schema::Resource;
use crate::telemetry::table_span;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, Instrument};

/// Resolve every root unit, `table_sems[0]` bounding the roots in flight
pub(crate) async fn run(ctx: Arc<SyncContext>, roots: Vec<WorkUnit>) {
    let mut tasks = JoinSet::new();
    for unit in roots {
        let permit = match ctx.limits.acquire_table(0, &ctx.cancel).await {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Sync cancelled, not starting remaining tables");
                break;
            }
        };
        let ctx = Arc::clone(&ctx);
        tasks.spawn(async move {
            resolve_table(ctx, unit, 0).await;
            drop(permit);
        });
    }
    join_all(&mut tasks).await;
}

/// One table invocation at `depth` (roots are 0), including all descendants
fn resolve_table(ctx: Arc<SyncContext>, unit: WorkUnit, depth: usize) -> BoxFuture<'static, ()> {
    let span = table_span(&unit.table.name, unit.client.id(), depth);
    async move {
        let selector = ctx.metrics.selector(&unit.table.name, unit.client.id());
        selector.start();
        if unit.is_root() {
            info!("Table sync started");
        }

        let relations_ctx = Arc::clone(&ctx);
        let parent_unit = unit.clone();
        run_table(&ctx, &unit, &selector, move |resource| {
            let ctx = Arc::clone(&relations_ctx);
            resolve_relations(ctx, parent_unit.clone(), resource, depth).boxed()
        })
        .await;

        if unit.is_root() {
            ctx.metrics.end(&unit.table.name, unit.client.id());
            info!(
                resources = selector.resources(),
                errors = selector.errors(),
                panics = selector.panics(),
                "Table sync finished"
            );
        }
    }
    .instrument(span)
    .boxed()
}

/// Spawn one invocation per relation of `resource` and wait for all of them
async fn resolve_relations(
    ctx: Arc<SyncContext>,
    parent: WorkUnit,
    resource: Arc<Resource>,
    depth: usize,
) {
    if parent.table.relations.is_empty() {
        return;
    }
    let child_depth = depth + 1;
    let mut tasks = JoinSet::new();
    for relation in &parent.table.relations {
        let nested = match ctx
            .limits
            .acquire_nested(&parent.table.name, parent.client.id(), &ctx.cancel)
            .await
        {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let table_permit = match ctx.limits.acquire_table(child_depth, &ctx.cancel).await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let unit = WorkUnit::child(
            Arc::clone(relation),
            Arc::clone(&parent.client),
            Arc::clone(&resource),
        );
        let ctx = Arc::clone(&ctx);
        tasks.spawn(async move {
            resolve_table(ctx, unit, child_depth).await;
            drop((nested, table_permit));
        });
    }
    join_all(&mut tasks).await;
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(error = %e, "Table task panicked");
            }
        }
    }
}
