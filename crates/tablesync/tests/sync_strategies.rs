//! End-to-end syncs through the public API, run once per walk strategy
//!
//! Every strategy must produce the same rows and metrics; only dispatch order
//! differs.
//!
//! Run with: cargo test -p tablesync --test sync_strategies

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tablesync::prelude::*;
use tablesync::testing::{
    collect_output, CollectedOutput, CountingResolver, ErrorResolver, HangingResolver,
    PanicResolver, TestClient,
};
use tokio::sync::mpsc;

fn config(strategy: Strategy) -> SchedulerConfig {
    SchedulerConfig::default()
        .with_strategy(strategy)
        .with_queue_workers(16)
        .with_batch(BatchSettings::default().with_timeout_ms(20))
}

async fn run_sync(
    config: SchedulerConfig,
    tables: &Tables,
    client: ClientRef,
) -> (Result<SyncSummary, SyncError>, CollectedOutput) {
    let (tx, rx) = mpsc::channel(64);
    let collector = tokio::spawn(collect_output(rx));
    let result = Scheduler::new(config)
        .expect("valid config")
        .sync(client, tables, tx)
        .await;
    let output = collector.await.expect("collector task");
    (result, output)
}

fn static_items(n: usize) -> Vec<serde_json::Value> {
    (0..n).map(|i| json!({"id": i, "name": format!("item-{i}")})).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_static_items() {
    for strategy in Strategy::ALL {
        let tables: Tables = vec![Table::new("t")
            .with_column(
                Column::new("test_column", ColumnType::Utf8)
                    .with_resolver(FnColumnResolver::new(|_, _| Ok(json!("test")))),
            )
            .with_resolver(StaticResolver::new(static_items(3)))]
        .into();

        let (result, output) = run_sync(config(strategy), &tables, TestClient::arc("c1")).await;
        let summary = result.unwrap_or_else(|e| panic!("{strategy}: {e}"));

        assert_eq!(output.migrated, vec!["t"], "{strategy}");
        assert_eq!(output.row_count("t"), 3, "{strategy}");
        assert_eq!(output.column("t", "test_column"), vec![json!("test"); 3], "{strategy}");
        assert_eq!(summary.metrics.resources("t", "c1"), 3, "{strategy}");
        assert_eq!(summary.total_errors(), 0, "{strategy}");
        assert!(summary.metrics.in_progress().is_empty(), "{strategy}");

        let snapshot = serde_json::to_value(summary.metrics.snapshot()).unwrap();
        assert_eq!(snapshot["tables"]["t"]["c1"]["resources"], json!(3));
    }
}

#[tokio::test]
async fn test_empty_forest() {
    for strategy in Strategy::ALL {
        let (result, output) =
            run_sync(config(strategy), &Tables::default(), TestClient::arc("c1")).await;
        assert!(matches!(result, Err(SyncError::NoTables)), "{strategy}");
        assert!(output.migrated.is_empty());
        assert_eq!(output.total_rows(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_table_is_isolated() {
    for strategy in Strategy::ALL {
        let tables: Tables = vec![
            Table::new("boom")
                .with_column(Column::new("id", ColumnType::Int64))
                .with_resolver(PanicResolver),
            Table::new("ok")
                .with_column(Column::new("id", ColumnType::Int64))
                .with_resolver(StaticResolver::new(static_items(2))),
        ]
        .into();

        let (result, output) = run_sync(config(strategy), &tables, TestClient::arc("c1")).await;
        let summary = result.unwrap_or_else(|e| panic!("{strategy}: {e}"));

        assert_eq!(summary.metrics.panics("boom", "c1"), 1, "{strategy}");
        assert_eq!(summary.metrics.resources("boom", "c1"), 0, "{strategy}");
        assert_eq!(summary.metrics.resources("ok", "c1"), 2, "{strategy}");
        assert_eq!(output.row_count("boom"), 0);
        assert_eq!(output.row_count("ok"), 2);
        assert_eq!(output.error_tables(), vec!["boom"], "{strategy}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_table_reports_error_message() {
    for strategy in Strategy::ALL {
        let tables: Tables = vec![Table::new("broken").with_resolver(ErrorResolver::new("rate limited"))]
            .into();

        let (result, output) = run_sync(config(strategy), &tables, TestClient::arc("c1")).await;
        let summary = result.unwrap_or_else(|e| panic!("{strategy}: {e}"));

        assert_eq!(summary.metrics.errors("broken", "c1"), 1, "{strategy}");
        assert_eq!(output.errors.len(), 1);
        assert!(output.errors[0].1.contains("rate limited"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_relation_resolved_once_per_parent_row() {
    const PARENTS: usize = 4;
    const CHILDREN_PER_PARENT: usize = 2;

    for strategy in Strategy::ALL {
        let children = CountingResolver::new(static_items(CHILDREN_PER_PARENT));
        let tables: Tables = vec![Table::new("parent")
            .with_column(Column::new("id", ColumnType::Int64))
            .with_resolver(StaticResolver::new(static_items(PARENTS)))
            .with_relation(
                Table::new("child")
                    .with_column(Column::new("id", ColumnType::Int64))
                    .with_resolver(children.clone()),
            )]
        .into();

        let (result, output) = run_sync(config(strategy), &tables, TestClient::arc("c1")).await;
        let summary = result.unwrap_or_else(|e| panic!("{strategy}: {e}"));

        assert_eq!(children.calls(), PARENTS, "{strategy}");
        assert_eq!(
            summary.metrics.resources("child", "c1"),
            (PARENTS * CHILDREN_PER_PARENT) as u64,
            "{strategy}"
        );

        let parent_ids: HashSet<String> = output.sync_ids("parent").into_iter().collect();
        assert_eq!(parent_ids.len(), PARENTS);

        let mut per_parent: HashMap<String, usize> = HashMap::new();
        for value in output.column("child", "_sync_parent_id") {
            let id = value.as_str().expect("child rows carry a parent id").to_string();
            *per_parent.entry(id).or_default() += 1;
        }
        assert_eq!(per_parent.keys().cloned().collect::<HashSet<_>>(), parent_ids);
        assert!(per_parent.values().all(|&n| n == CHILDREN_PER_PARENT));

        for invocation in children.invocations() {
            let parent = invocation.parent_id.expect("relation invoked with a parent");
            assert!(parent_ids.contains(&parent.to_string()));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_child_row_links_back_to_parent() {
    for strategy in Strategy::ALL {
        let tables: Tables = vec![Table::new("t")
            .with_column(Column::new("name", ColumnType::Utf8))
            .with_resolver(StaticResolver::new(vec![json!({"name": "root"})]))
            .with_relation(
                Table::new("r")
                    .with_column(Column::new("name", ColumnType::Utf8))
                    .with_column(
                        Column::new("parent_name", ColumnType::Utf8)
                            .with_resolver(ParentColumnResolver::new("name")),
                    )
                    .with_resolver(StaticResolver::new(vec![json!({"name": "leaf"})])),
            )]
        .into();

        let (result, output) = run_sync(config(strategy), &tables, TestClient::arc("c1")).await;
        result.unwrap_or_else(|e| panic!("{strategy}: {e}"));

        assert_eq!(output.row_count("t"), 1, "{strategy}");
        assert_eq!(output.row_count("r"), 1, "{strategy}");
        let parent_id = output.sync_ids("t").remove(0);
        assert_eq!(output.column("r", "_sync_parent_id"), vec![json!(parent_id)]);
        assert_eq!(output.column("r", "parent_name"), vec![json!("root")]);
    }
}

#[tokio::test]
async fn test_depth_limit_checked_before_any_resolver() {
    fn chain(depth: usize, resolver: &CountingResolver) -> Table {
        let table = Table::new(format!("level{depth}")).with_resolver(resolver.clone());
        if depth == 1 {
            return table;
        }
        table.with_relation(chain(depth - 1, resolver))
    }

    for strategy in Strategy::ALL {
        let resolver = CountingResolver::new(static_items(1));
        let tables: Tables = vec![chain(5, &resolver)].into();

        let (result, output) = run_sync(config(strategy), &tables, TestClient::arc("c1")).await;
        assert!(
            matches!(result, Err(SyncError::MaxDepthExceeded { depth: 5, max: 4 })),
            "{strategy}"
        );
        assert_eq!(resolver.calls(), 0);
        assert!(output.migrated.is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batches_neither_lose_nor_duplicate_rows() {
    const ROWS: usize = 250;

    for strategy in Strategy::ALL {
        let tables: Tables = vec![Table::new("big")
            .with_column(Column::new("id", ColumnType::Int64))
            .with_resolver(StaticResolver::from_pages(
                static_items(ROWS).chunks(40).map(<[_]>::to_vec).collect(),
            ))]
        .into();
        let config = config(strategy).with_batch(BatchSettings::default().with_max_rows(100));

        let (result, output) = run_sync(config, &tables, TestClient::arc("c1")).await;
        result.unwrap_or_else(|e| panic!("{strategy}: {e}"));

        assert!(output.batch_sizes("big").iter().all(|&n| n <= 100), "{strategy}");
        let ids: HashSet<i64> = output
            .column("big", "id")
            .iter()
            .filter_map(serde_json::Value::as_i64)
            .collect();
        assert_eq!(output.row_count("big"), ROWS, "{strategy}");
        assert_eq!(ids, (0..ROWS as i64).collect::<HashSet<_>>(), "{strategy}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multiplexed_clients() {
    for strategy in Strategy::ALL {
        let tables: Tables = vec![Table::new("per_region")
            .with_column(Column::new("id", ColumnType::Int64))
            .with_multiplex(|_| {
                ["eu", "us", "ap", "eu"]
                    .into_iter()
                    .map(TestClient::arc)
                    .collect()
            })
            .with_resolver(StaticResolver::new(static_items(2)))]
        .into();

        let (result, output) = run_sync(config(strategy), &tables, TestClient::arc("root")).await;
        let summary = result.unwrap_or_else(|e| panic!("{strategy}: {e}"));

        for region in ["eu", "us", "ap"] {
            assert_eq!(summary.metrics.resources("per_region", region), 2, "{strategy}");
        }
        assert_eq!(output.row_count("per_region"), 6, "{strategy}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deterministic_ids_are_stable() {
    let tables: Tables = vec![Table::new("keyed")
        .with_column(Column::new("id", ColumnType::Int64).primary_key())
        .with_resolver(StaticResolver::new(static_items(5)))]
    .into();

    let mut runs = Vec::new();
    for strategy in [Strategy::Dfs, Strategy::PriorityQueue] {
        let config = config(strategy).with_deterministic_ids(true);
        let (result, output) = run_sync(config, &tables, TestClient::arc("c1")).await;
        result.unwrap();
        let ids: HashSet<String> = output.sync_ids("keyed").into_iter().collect();
        assert_eq!(ids.len(), 5);
        runs.push(ids);
    }
    assert_eq!(runs[0], runs[1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancellation_stops_a_hanging_sync() {
    for strategy in Strategy::ALL {
        let tables: Tables = vec![
            Table::new("hangs")
                .with_column(Column::new("id", ColumnType::Int64))
                .with_resolver(HangingResolver::new(static_items(3))),
            Table::new("quick")
                .with_column(Column::new("id", ColumnType::Int64))
                .with_resolver(StaticResolver::new(static_items(3))),
        ]
        .into();

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(64);
        let collector = tokio::spawn(collect_output(rx));
        let trigger = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            })
        };

        let scheduler = Scheduler::new(config(strategy)).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            scheduler.sync_with_cancellation(TestClient::arc("c1"), &tables, tx, cancel),
        )
        .await
        .unwrap_or_else(|_| panic!("{strategy}: sync did not stop after cancellation"));

        assert!(matches!(result, Err(SyncError::Cancelled)), "{strategy}");
        trigger.await.unwrap();
        let output = collector.await.unwrap();
        assert_eq!(output.migrated.len(), 2);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pre_resource_hook_rejects_rows() {
    let tables: Tables = vec![Table::new("filtered")
        .with_column(Column::new("id", ColumnType::Int64))
        .with_pre_resource_resolve(FnResourceHook::new(|_, resource| {
            match resource.item()["id"].as_i64() {
                Some(id) if id % 2 == 1 => Err(ResolverError::api("odd id")),
                _ => Ok(()),
            }
        }))
        .with_resolver(StaticResolver::new(static_items(6)))]
    .into();

    let client: ClientRef = Arc::new(TestClient::new("c1"));
    let (result, output) = run_sync(config(Strategy::RoundRobin), &tables, client).await;
    let summary = result.unwrap();

    assert_eq!(summary.metrics.resources("filtered", "c1"), 3);
    assert_eq!(summary.metrics.errors("filtered", "c1"), 3);
    assert_eq!(output.column("filtered", "id").len(), 3);
}

// ============================================================================
// Shutdown
// ============================================================================

/// Sends its items from the resolver and parks a clone of the sender in a
/// task that never finishes. With `stall`, the resolver itself never returns.
struct DetachedSender {
    items: Vec<serde_json::Value>,
    stall: bool,
}

#[async_trait]
impl TableResolver for DetachedSender {
    async fn resolve(
        &self,
        _client: ClientRef,
        _parent: Option<Arc<Resource>>,
        tx: ItemSender,
    ) -> ResolverResult<()> {
        let parked = tx.clone();
        tokio::spawn(async move {
            let _parked = parked;
            std::future::pending::<()>().await;
        });
        tx.send_page(self.items.clone()).await?;
        if self.stall {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Pages through an endless upstream until the item channel closes
struct EndlessResolver;

#[async_trait]
impl TableResolver for EndlessResolver {
    async fn resolve(
        &self,
        _client: ClientRef,
        _parent: Option<Arc<Resource>>,
        tx: ItemSender,
    ) -> ResolverResult<()> {
        let mut next = 0i64;
        loop {
            let page = (next..next + 10).map(|id| json!({"id": id})).collect();
            tx.send_page(page).await?;
            next += 10;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_table_finishes_when_resolver_returns_with_sender_alive() {
    for strategy in Strategy::ALL {
        let tables: Tables = vec![Table::new("detached")
            .with_column(Column::new("id", ColumnType::Int64))
            .with_resolver(DetachedSender {
                items: static_items(3),
                stall: false,
            })]
        .into();

        let (result, output) = tokio::time::timeout(
            Duration::from_secs(10),
            run_sync(config(strategy), &tables, TestClient::arc("c1")),
        )
        .await
        .unwrap_or_else(|_| panic!("{strategy}: sync outlived its only resolver"));

        result.unwrap_or_else(|e| panic!("{strategy}: {e}"));
        assert_eq!(output.row_count("detached"), 3, "{strategy}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancellation_with_sender_held_elsewhere() {
    for strategy in Strategy::ALL {
        let tables: Tables = vec![Table::new("stalled")
            .with_column(Column::new("id", ColumnType::Int64))
            .with_resolver(DetachedSender {
                items: static_items(3),
                stall: true,
            })]
        .into();

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(64);
        let collector = tokio::spawn(collect_output(rx));
        let trigger = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            })
        };

        let scheduler = Scheduler::new(config(strategy)).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            scheduler.sync_with_cancellation(TestClient::arc("c1"), &tables, tx, cancel),
        )
        .await
        .unwrap_or_else(|_| panic!("{strategy}: sync did not stop after cancellation"));

        assert!(matches!(result, Err(SyncError::Cancelled)), "{strategy}");
        trigger.await.unwrap();
        collector.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_output_closed_mid_sync_stops_resolvers() {
    for strategy in Strategy::ALL {
        let tables: Tables = vec![Table::new("endless")
            .with_column(Column::new("id", ColumnType::Int64))
            .with_resolver(EndlessResolver)]
        .into();

        let settings = BatchSettings::default().with_max_rows(10).with_timeout_ms(20);
        let scheduler = Scheduler::new(config(strategy).with_batch(settings)).unwrap();
        let (tx, mut rx) = mpsc::channel::<SyncMessage>(64);
        let reader = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if message.is_insert() {
                    break;
                }
            }
        });

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            scheduler.sync(TestClient::arc("c1"), &tables, tx),
        )
        .await
        .unwrap_or_else(|_| panic!("{strategy}: sync kept running without a reader"));

        assert!(matches!(result, Err(SyncError::OutputClosed)), "{strategy}");
        reader.await.unwrap();
    }
}

// ============================================================================
// Concurrency limits
// ============================================================================

/// High-water mark of concurrently running calls
#[derive(Clone, Default)]
struct Gauge {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Gauge {
    async fn measure(&self, hold: Duration) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(hold).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct GaugedHook(Gauge);

#[async_trait]
impl ResourceHook for GaugedHook {
    async fn call(&self, _client: &ClientRef, _resource: &mut Resource) -> ResolverResult<()> {
        self.0.measure(Duration::from_millis(5)).await;
        Ok(())
    }
}

struct GaugedResolver(Gauge);

#[async_trait]
impl TableResolver for GaugedResolver {
    async fn resolve(
        &self,
        _client: ClientRef,
        _parent: Option<Arc<Resource>>,
        tx: ItemSender,
    ) -> ResolverResult<()> {
        self.0.measure(Duration::from_millis(10)).await;
        tx.send(json!({"id": 1})).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resource_limit_caps_in_flight_rows() {
    for (strategy, cap) in Strategy::ALL.into_iter().flat_map(|s| [(s, 1u64), (s, 3)]) {
        let gauge = Gauge::default();
        let tables: Tables = vec![Table::new("rows")
            .with_column(Column::new("id", ColumnType::Int64))
            .with_pre_resource_resolve(GaugedHook(gauge.clone()))
            .with_resolver(StaticResolver::new(static_items(12)))]
        .into();

        let config = config(strategy).with_single_resource_max_concurrency(cap);
        let (result, output) = run_sync(config, &tables, TestClient::arc("c1")).await;
        result.unwrap_or_else(|e| panic!("{strategy}: {e}"));

        assert_eq!(output.row_count("rows"), 12, "{strategy}");
        assert!(gauge.peak() >= 1, "{strategy}");
        assert!(gauge.peak() <= cap as usize, "{strategy}: peak {} > {cap}", gauge.peak());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_nested_limit_caps_child_invocations() {
    for strategy in Strategy::ALL {
        let gauge = Gauge::default();
        let tables: Tables = vec![Table::new("parent")
            .with_column(Column::new("id", ColumnType::Int64))
            .with_resolver(StaticResolver::new(static_items(6)))
            .with_relation(
                Table::new("child")
                    .with_column(Column::new("id", ColumnType::Int64))
                    .with_resolver(GaugedResolver(gauge.clone())),
            )]
        .into();

        let config = config(strategy).with_single_nested_table_max_concurrency(1);
        let (result, output) = run_sync(config, &tables, TestClient::arc("c1")).await;
        result.unwrap_or_else(|e| panic!("{strategy}: {e}"));

        assert_eq!(output.row_count("child"), 6, "{strategy}");
        assert_eq!(gauge.peak(), 1, "{strategy}");
    }
}
