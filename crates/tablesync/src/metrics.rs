//! Per (table, client) sync metrics
//!
//! The table → client map is fully populated before the sync starts and is
//! read-only afterwards; all updates go through atomics or `OnceLock`s, so
//! resolver tasks never contend on the map itself.

use crate::schema::{ClientRef, Table};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Start/end pair where only the first `start` and first `end` count
#[derive(Debug, Default)]
pub struct DurationMeasurement {
    start: OnceLock<Instant>,
    end: OnceLock<Instant>,
}

impl DurationMeasurement {
    /// Returns true if this call recorded the start
    pub fn start(&self) -> bool {
        self.start.set(Instant::now()).is_ok()
    }

    /// Returns true if this call recorded the end
    pub fn end(&self) -> bool {
        self.end.set(Instant::now()).is_ok()
    }

    pub fn is_started(&self) -> bool {
        self.start.get().is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.end.get().is_some()
    }

    pub fn in_progress(&self) -> bool {
        self.is_started() && !self.is_ended()
    }

    /// Elapsed time between start and end, once both are recorded
    pub fn duration(&self) -> Option<Duration> {
        let start = self.start.get()?;
        let end = self.end.get()?;
        Some(end.saturating_duration_since(*start))
    }
}

/// Counters of one (table, client) pair
#[derive(Debug, Default)]
pub struct TableClientMetrics {
    pub resources: AtomicU64,
    pub errors: AtomicU64,
    pub panics: AtomicU64,
    pub duration: DurationMeasurement,
}

#[derive(Debug, Default)]
struct TableMetrics {
    clients: HashMap<String, Arc<TableClientMetrics>>,
    /// Wall time across all clients of the table
    wall: Arc<WallClock>,
    relations: Vec<String>,
}

#[derive(Debug, Default)]
struct WallClock {
    duration: DurationMeasurement,
    pending_clients: AtomicUsize,
}

/// Handle to the counters of one pair, resolved once per call site
#[derive(Debug, Clone)]
pub struct Selector {
    pair: Arc<TableClientMetrics>,
    wall: Arc<WallClock>,
}

impl Selector {
    pub fn add_resources(&self, n: u64) {
        self.pair.resources.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_errors(&self, n: u64) {
        self.pair.errors.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_panics(&self, n: u64) {
        self.pair.panics.fetch_add(n, Ordering::Relaxed);
    }

    /// Mark the pair (and its table) started; later calls are no-ops
    pub fn start(&self) {
        self.pair.duration.start();
        self.wall.duration.start();
    }

    pub fn resources(&self) -> u64 {
        self.pair.resources.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.pair.errors.load(Ordering::Relaxed)
    }

    pub fn panics(&self) -> u64 {
        self.pair.panics.load(Ordering::Relaxed)
    }

    fn end(&self) {
        if self.pair.duration.end() {
            let previous = self.wall.pending_clients.fetch_sub(1, Ordering::AcqRel);
            if previous <= 1 {
                self.wall.duration.end();
            }
        }
    }
}

/// Metrics of one sync
#[derive(Debug, Default)]
pub struct Metrics {
    tables: HashMap<String, TableMetrics>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `table` and all its relations for every client in `clients`
    pub fn init_with_clients(&mut self, table: &Table, clients: &[ClientRef]) {
        let entry = self.tables.entry(table.name.clone()).or_default();
        entry.relations = table.relations.iter().map(|r| r.name.clone()).collect();
        for client in clients {
            if !entry.clients.contains_key(client.id()) {
                entry
                    .clients
                    .insert(client.id().to_string(), Arc::default());
                entry.wall.pending_clients.fetch_add(1, Ordering::Relaxed);
            }
        }
        for relation in &table.relations {
            self.init_with_clients(relation, clients);
        }
    }

    /// Counters for a pair.
    ///
    /// Pairs that were never registered get detached counters, so a
    /// misconfigured call site loses its numbers instead of failing.
    pub fn selector(&self, table: &str, client: &str) -> Selector {
        match self.tables.get(table) {
            Some(metrics) => Selector {
                pair: metrics.clients.get(client).cloned().unwrap_or_default(),
                wall: Arc::clone(&metrics.wall),
            },
            None => Selector {
                pair: Arc::default(),
                wall: Arc::default(),
            },
        }
    }

    /// Mark a pair finished, along with the same client on every
    /// descendant table. Descendants that never ran stop reading as in
    /// progress.
    pub fn end(&self, table: &str, client: &str) {
        let Some(metrics) = self.tables.get(table) else {
            return;
        };
        if metrics.clients.contains_key(client) {
            self.selector(table, client).end();
        }
        for relation in &metrics.relations {
            self.end(relation, client);
        }
    }

    /// Mark every pair finished
    pub fn end_all(&self) {
        for (table, metrics) in &self.tables {
            for client in metrics.clients.keys() {
                self.selector(table, client).end();
            }
        }
    }

    /// Pairs that started and have not ended, sorted
    pub fn in_progress(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self
            .tables
            .iter()
            .flat_map(|(table, metrics)| {
                metrics
                    .clients
                    .iter()
                    .filter(|(_, m)| m.duration.in_progress())
                    .map(move |(client, _)| (table.clone(), client.clone()))
            })
            .collect();
        pairs.sort();
        pairs
    }

    pub fn resources(&self, table: &str, client: &str) -> u64 {
        self.pair(table, client)
            .map(|m| m.resources.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn errors(&self, table: &str, client: &str) -> u64 {
        self.pair(table, client)
            .map(|m| m.errors.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn panics(&self, table: &str, client: &str) -> u64 {
        self.pair(table, client)
            .map(|m| m.panics.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Wall time of a table across all its clients, once every client ended
    pub fn table_duration(&self, table: &str) -> Option<Duration> {
        self.tables.get(table)?.wall.duration.duration()
    }

    pub fn total_resources(&self) -> u64 {
        self.sum(|m| m.resources.load(Ordering::Relaxed))
    }

    pub fn total_errors(&self) -> u64 {
        self.sum(|m| m.errors.load(Ordering::Relaxed))
    }

    pub fn total_panics(&self) -> u64 {
        self.sum(|m| m.panics.load(Ordering::Relaxed))
    }

    /// Point-in-time copy suitable for serialization
    pub fn snapshot(&self) -> MetricsSnapshot {
        let tables = self
            .tables
            .iter()
            .map(|(table, metrics)| {
                let clients = metrics
                    .clients
                    .iter()
                    .map(|(client, m)| {
                        let pair = PairSnapshot {
                            resources: m.resources.load(Ordering::Relaxed),
                            errors: m.errors.load(Ordering::Relaxed),
                            panics: m.panics.load(Ordering::Relaxed),
                            duration_ms: m.duration.duration().map(|d| d.as_millis() as u64),
                        };
                        (client.clone(), pair)
                    })
                    .collect();
                (table.clone(), clients)
            })
            .collect();
        MetricsSnapshot { tables }
    }

    fn pair(&self, table: &str, client: &str) -> Option<&Arc<TableClientMetrics>> {
        self.tables.get(table)?.clients.get(client)
    }

    fn sum(&self, f: impl Fn(&TableClientMetrics) -> u64) -> u64 {
        self.tables
            .values()
            .flat_map(|t| t.clients.values())
            .map(|m| f(m))
            .sum()
    }
}

/// Serializable metrics: table → client → counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub tables: BTreeMap<String, BTreeMap<String, PairSnapshot>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PairSnapshot {
    pub resources: u64,
    pub errors: u64,
    pub panics: u64,
    pub duration_ms: Option<u64>,
}
