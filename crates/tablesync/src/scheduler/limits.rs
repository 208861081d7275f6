//! Concurrency limiters
//!
//! - `table_sems[depth]`: table invocations in flight at each depth.
//! - `resource_sem`: resource resolutions in flight across the sync.
//! - per (table, client) pair: resource resolutions and child-table
//!   invocations, created on first use and kept for the whole sync.

use crate::config::SchedulerConfig;
use crate::error::{Result, SyncError};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

type PairKey = (String, String);

pub(crate) struct ConcurrencyLimits {
    table_sems: Vec<Arc<Semaphore>>,
    resource_sem: Arc<Semaphore>,
    pair_resource_sems: DashMap<PairKey, Arc<Semaphore>>,
    pair_nested_sems: DashMap<PairKey, Arc<Semaphore>>,
    pair_resource_permits: usize,
    pair_nested_permits: usize,
}

impl ConcurrencyLimits {
    pub(crate) fn new(config: &SchedulerConfig) -> Self {
        let table_sems = (0..config.max_depth)
            .map(|depth| Arc::new(Semaphore::new(config.depth_concurrency(depth))))
            .collect();
        Self {
            table_sems,
            resource_sem: Arc::new(Semaphore::new(config.resource_concurrency())),
            pair_resource_sems: DashMap::new(),
            pair_nested_sems: DashMap::new(),
            pair_resource_permits: config.per_pair_resource_concurrency().max(1),
            pair_nested_permits: config.per_pair_nested_concurrency().max(1),
        }
    }

    /// Permit to start a table invocation at `depth`
    pub(crate) async fn acquire_table(
        &self,
        depth: usize,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit> {
        let index = depth.min(self.table_sems.len().saturating_sub(1));
        let sem = self
            .table_sems
            .get(index)
            .cloned()
            .ok_or_else(|| SyncError::config("no table semaphores configured"))?;
        acquire(sem, cancel).await
    }

    /// Permit to resolve one resource of `(table, client)`.
    ///
    /// The pair permit is taken before the global one, so a single hot pair
    /// queues on its own semaphore instead of holding global permits.
    pub(crate) async fn acquire_resource(
        &self,
        table: &str,
        client: &str,
        cancel: &CancellationToken,
    ) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
        let pair = Self::pair_sem(
            &self.pair_resource_sems,
            table,
            client,
            self.pair_resource_permits,
        );
        let pair_permit = acquire(pair, cancel).await?;
        let global_permit = acquire(Arc::clone(&self.resource_sem), cancel).await?;
        Ok((pair_permit, global_permit))
    }

    /// Permit to start a child-table invocation under `(parent_table, client)`
    pub(crate) async fn acquire_nested(
        &self,
        parent_table: &str,
        client: &str,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit> {
        let sem = Self::pair_sem(
            &self.pair_nested_sems,
            parent_table,
            client,
            self.pair_nested_permits,
        );
        acquire(sem, cancel).await
    }

    /// Exactly one semaphore per pair, created without locking other pairs
    fn pair_sem(
        registry: &DashMap<PairKey, Arc<Semaphore>>,
        table: &str,
        client: &str,
        permits: usize,
    ) -> Arc<Semaphore> {
        let key = (table.to_string(), client.to_string());
        if let Some(sem) = registry.get(&key) {
            return Arc::clone(sem.value());
        }
        Arc::clone(
            registry
                .entry(key)
                .or_insert_with(|| Arc::new(Semaphore::new(permits)))
                .value(),
        )
    }

    #[cfg(test)]
    fn pair_count(&self) -> (usize, usize) {
        (self.pair_resource_sems.len(), self.pair_nested_sems.len())
    }
}

/// Acquire a permit unless the sync is cancelled first
pub(crate) async fn acquire(
    sem: Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SyncError::Cancelled),
        permit = sem.acquire_owned() => permit.map_err(|_| SyncError::Cancelled),
    }
}
