//! Resolver pipeline
//!
//! One table invocation:
//!
//! ```text
//! TableResolver ──pages──▶ per item: [resource permits] ─▶ pre hook ─▶ columns ─▶ post hook
//!                                                            ─▶ id ─▶ validate ─▶ emit ─▶ on_resource
//! ```
//!
//! Every resolver call goes through a catch boundary: errors and panics are
//! counted against the (table, client) pair and never leave the pipeline.

use super::limits::ConcurrencyLimits;
use super::work::WorkUnit;
use crate::config::SchedulerConfig;
use crate::error::{ResolverError, ResolverResult, ValidationError};
use crate::message::SyncMessage;
use crate::metrics::{Metrics, Selector};
use crate::schema::{default_value, Column, ItemPage, ItemSender, Resource};
use crate::telemetry::{panic_message, resource_span};
use dashmap::DashSet;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};
use uuid::Uuid;

/// Item pages buffered between a table resolver and its consumer
const PAGE_BUFFER: usize = 16;

/// State shared by every task of one sync
pub(crate) struct SyncContext {
    pub limits: ConcurrencyLimits,
    pub metrics: Arc<Metrics>,
    pub resources: mpsc::Sender<Arc<Resource>>,
    pub output: mpsc::Sender<SyncMessage>,
    /// Sync-scoped token, also tripped when the output channel closes
    pub cancel: CancellationToken,
    pub deterministic_ids: bool,
    /// Value-derived row ids already emitted, per table
    emitted_ids: DashSet<(String, Uuid)>,
    pub table_timeout: Duration,
    pub resource_timeout: Duration,
}

impl SyncContext {
    pub(crate) fn new(
        config: &SchedulerConfig,
        metrics: Arc<Metrics>,
        resources: mpsc::Sender<Arc<Resource>>,
        output: mpsc::Sender<SyncMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            limits: ConcurrencyLimits::new(config),
            metrics,
            resources,
            output,
            cancel,
            deterministic_ids: config.deterministic_ids,
            emitted_ids: DashSet::new(),
            table_timeout: config.table_timeout(),
            resource_timeout: config.resource_timeout(),
        }
    }

    /// Forward a resolved resource to the batcher. False once the sync is
    /// shutting down.
    pub(crate) async fn emit(&self, resource: Arc<Resource>) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.resources.send(resource) => sent.is_ok(),
        }
    }

    async fn send_output(&self, message: SyncMessage) {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {}
            sent = self.output.send(message) => {
                if sent.is_err() {
                    warn!("Output channel closed, stopping sync");
                    self.cancel.cancel();
                }
            }
        }
    }

    /// Claim a row id for its table, failing when another row already has it
    fn claim_id(&self, resource: &Resource) -> Result<(), ValidationError> {
        let table = resource.table();
        if !table.has_derived_ids(self.deterministic_ids) {
            return Ok(());
        }
        match resource.id() {
            Some(id) if !self.emitted_ids.insert((table.name.clone(), id)) => {
                Err(ValidationError::DuplicateId(id))
            }
            _ => Ok(()),
        }
    }

    /// Count and log a table resolver failure and report it downstream
    async fn table_failed(&self, unit: &WorkUnit, selector: &Selector, err: ResolverError) {
        record_failure(selector, unit, "table resolver", &err);
        self.send_output(SyncMessage::Error {
            table_name: unit.table.name.clone(),
            error: err.to_string(),
        })
        .await;
    }
}

/// Run a resolver call, turning a panic into [`ResolverError::Panic`]
async fn guarded<F>(call: F) -> ResolverResult<()>
where
    F: Future<Output = ResolverResult<()>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(ResolverError::Panic(panic_message(payload.as_ref()))),
    }
}

fn record_failure(selector: &Selector, unit: &WorkUnit, stage: &str, err: &ResolverError) {
    let table = unit.table.name.as_str();
    let client = unit.client.id();
    if err.is_panic() {
        selector.add_panics(1);
        error!(
            table,
            client,
            stage,
            error = %err,
            stack = %Backtrace::capture(),
            "Recovered from panic"
        );
    } else {
        selector.add_errors(1);
        error!(table, client, stage, error = %err, "Resolver failed");
    }
}

/// Start a table resolver.
///
/// Returns the resolver future and the receiving end of its item pages. The
/// caller must poll both concurrently; the page stream ends when the
/// resolver returns, fails or the sync is cancelled.
pub(crate) fn invoke_table(
    ctx: &Arc<SyncContext>,
    unit: &WorkUnit,
    selector: Selector,
) -> (BoxFuture<'static, ()>, mpsc::Receiver<ItemPage>) {
    let (tx, rx) = ItemSender::channel(PAGE_BUFFER);
    let ctx = Arc::clone(ctx);
    let unit = unit.clone();

    let call = async move {
        let Some(resolver) = unit.table.resolver.clone() else {
            debug!(table = %unit.table.name, "Table has no resolver");
            return;
        };
        let outcome = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return,
            outcome = tokio::time::timeout(
                ctx.table_timeout,
                guarded(resolver.resolve(Arc::clone(&unit.client), unit.parent.clone(), tx)),
            ) => outcome,
        };
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(ResolverError::Cancelled)) if ctx.cancel.is_cancelled() => {}
            Ok(Err(err)) => ctx.table_failed(&unit, &selector, err).await,
            Err(_) => {
                let err = ResolverError::Timeout(ctx.table_timeout);
                ctx.table_failed(&unit, &selector, err).await
            }
        }
    };
    (call.boxed(), rx)
}

/// Resolve one table invocation to completion.
///
/// Items are resolved concurrently under the resource limits; each resource
/// that survives validation is emitted and then handed to `on_resource`
/// (spawning or queueing its relations). The item stream ends when the
/// resolver returns, even if a clone of its [`ItemSender`] is still alive.
/// Returns after every spawned resource task has finished.
pub(crate) async fn run_table<F>(
    ctx: &Arc<SyncContext>,
    unit: &WorkUnit,
    selector: &Selector,
    on_resource: F,
) where
    F: Fn(Arc<Resource>) -> BoxFuture<'static, ()> + Clone + Send + Sync + 'static,
{
    let (resolver, pages) = invoke_table(ctx, unit, selector.clone());
    let (finished_tx, mut finished_rx) = oneshot::channel::<()>();
    let resolver = async move {
        resolver.await;
        let _ = finished_tx.send(());
    };
    let mut tasks = JoinSet::new();

    let drain = async {
        let mut pages = pages;
        let mut closed = false;
        loop {
            let page = tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => return,
                page = pages.recv() => page,
                _ = &mut finished_rx, if !closed => {
                    // pages already buffered are still delivered
                    pages.close();
                    closed = true;
                    continue;
                }
            };
            let Some(page) = page else {
                return;
            };
            for item in page {
                let permits = match ctx
                    .limits
                    .acquire_resource(&unit.table.name, unit.client.id(), &ctx.cancel)
                    .await
                {
                    Ok(permits) => permits,
                    Err(_) => return,
                };
                let ctx = Arc::clone(ctx);
                let unit = unit.clone();
                let selector = selector.clone();
                let on_resource = on_resource.clone();
                tasks.spawn(async move {
                    let resolved = resolve_resource(&ctx, &unit, &selector, item).await;
                    drop(permits);
                    if let Some(resource) = resolved {
                        if ctx.emit(Arc::clone(&resource)).await {
                            on_resource(resource).await;
                        }
                    }
                });
            }
        }
    };
    tokio::join!(resolver, drain);

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                selector.add_panics(1);
                error!(
                    table = %unit.table.name,
                    client = %unit.client.id(),
                    "Resource task panicked"
                );
            }
        }
    }
}

/// Build, resolve and validate one resource. `None` when the row is dropped.
pub(crate) async fn resolve_resource(
    ctx: &SyncContext,
    unit: &WorkUnit,
    selector: &Selector,
    item: Value,
) -> Option<Arc<Resource>> {
    let span = resource_span(&unit.table.name, unit.client.id());
    let resolve = async {
        let table = &unit.table;
        let mut resource = Resource::new(Arc::clone(table), unit.parent.clone(), item);

        if let Some(hook) = &table.pre_resource_resolve {
            if let Err(err) = guarded(hook.call(&unit.client, &mut resource)).await {
                record_failure(selector, unit, "pre-resource hook", &err);
                return None;
            }
        }

        for column in &table.columns {
            resolve_column(unit, selector, &mut resource, column).await;
        }

        if let Some(hook) = &table.post_resource_resolve {
            if let Err(err) = guarded(hook.call(&unit.client, &mut resource)).await {
                record_failure(selector, unit, "post-resource hook", &err);
            }
        }

        resource.calculate_id(ctx.deterministic_ids);
        for problem in resource.validate() {
            if problem.is_fatal() {
                selector.add_errors(1);
                error!(
                    table = %table.name,
                    client = %unit.client.id(),
                    error = %problem,
                    "Dropping invalid resource"
                );
                return None;
            }
            warn!(
                table = %table.name,
                client = %unit.client.id(),
                error = %problem,
                "Resource failed validation"
            );
        }
        if let Err(problem) = ctx.claim_id(&resource) {
            selector.add_errors(1);
            error!(
                table = %table.name,
                client = %unit.client.id(),
                error = %problem,
                "Dropping invalid resource"
            );
            return None;
        }

        selector.add_resources(1);
        Some(Arc::new(resource))
    };

    let guarded_resolve = AssertUnwindSafe(resolve.instrument(span)).catch_unwind();
    let outcome = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => return None,
        outcome = tokio::time::timeout(ctx.resource_timeout, guarded_resolve) => outcome,
    };
    match outcome {
        Ok(Ok(resolved)) => resolved,
        Ok(Err(payload)) => {
            let err = ResolverError::Panic(panic_message(payload.as_ref()));
            record_failure(selector, unit, "resource", &err);
            None
        }
        Err(_) => {
            let err = ResolverError::Timeout(ctx.resource_timeout);
            record_failure(selector, unit, "resource", &err);
            None
        }
    }
}

/// Resolve one column: its own resolver, or the item field of the same name
async fn resolve_column(
    unit: &WorkUnit,
    selector: &Selector,
    resource: &mut Resource,
    column: &Column,
) {
    let result = match &column.resolver {
        Some(resolver) => guarded(resolver.resolve(&unit.client, resource, column)).await,
        None => {
            let value = default_value(resource.item(), &column.name);
            resource.set(&column.name, value)
        }
    };
    if let Err(err) = result {
        let stage = format!("column {}", column.name);
        record_failure(selector, unit, &stage, &err);
    }
}
