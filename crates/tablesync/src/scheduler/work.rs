//! Work units and root enumeration
//!
//! Root ordering per strategy:
//!
//! ```text
//! dfs          t1/c1 t1/c2 t2/c1 t2/c2
//! round-robin  t1/c1 t2/c1 t1/c2 t2/c2
//! shuffle      seeded permutation of round-robin
//! ```
//!
//! Sharding is applied to the ordered list.

use super::Strategy;
use crate::config::Shard;
use crate::schema::{ClientRef, Resource, Table, Tables};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// One table invocation: resolve `table` for `client`, under `parent` for relations
#[derive(Clone)]
pub struct WorkUnit {
    pub table: Arc<Table>,
    pub client: ClientRef,
    pub parent: Option<Arc<Resource>>,
}

impl WorkUnit {
    pub fn root(table: Arc<Table>, client: ClientRef) -> Self {
        Self {
            table,
            client,
            parent: None,
        }
    }

    pub fn child(table: Arc<Table>, client: ClientRef, parent: Arc<Resource>) -> Self {
        Self {
            table,
            client,
            parent: Some(parent),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnit")
            .field("table", &self.table.name)
            .field("client", &self.client.id())
            .field("parent", &self.parent.as_ref().and_then(|p| p.id()))
            .finish()
    }
}

/// Root tables with the clients each one runs under
pub(crate) type RootClients = Vec<(Arc<Table>, Vec<ClientRef>)>;

/// Clients a table runs under: its multiplexer's output with duplicate ids
/// removed, or the ambient client when it has no multiplexer
pub fn multiplex_clients(table: &Table, client: &ClientRef) -> Vec<ClientRef> {
    let Some(multiplex) = &table.multiplex else {
        return vec![Arc::clone(client)];
    };
    let mut seen = HashSet::new();
    let mut clients = Vec::new();
    for candidate in multiplex(client) {
        if seen.insert(candidate.id().to_string()) {
            clients.push(candidate);
        } else {
            warn!(
                table = %table.name,
                client = %candidate.id(),
                "Multiplexer returned a duplicate client, skipping"
            );
        }
    }
    clients
}

pub(crate) fn root_clients(tables: &Tables, client: &ClientRef) -> RootClients {
    tables
        .iter()
        .map(|table| (Arc::clone(table), multiplex_clients(table, client)))
        .collect()
}

/// Every client of a table before moving to the next table
pub(crate) fn depth_first_order(roots: &RootClients) -> Vec<WorkUnit> {
    roots
        .iter()
        .flat_map(|(table, clients)| {
            clients
                .iter()
                .map(|client| WorkUnit::root(Arc::clone(table), Arc::clone(client)))
        })
        .collect()
}

/// First client of every table, then the second client of every table, ...
pub(crate) fn round_robin_interleave(roots: &RootClients) -> Vec<WorkUnit> {
    let mut units = Vec::new();
    let mut c = 0;
    loop {
        let mut added = false;
        for (table, clients) in roots {
            if let Some(client) = clients.get(c) {
                units.push(WorkUnit::root(Arc::clone(table), Arc::clone(client)));
                added = true;
            }
        }
        if !added {
            break;
        }
        c += 1;
    }
    units
}

/// 64-bit FNV-1a
fn fnv1a_hash(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Seed derived from the sorted root table names only; clients do not
/// affect it
pub(crate) fn shuffle_seed(roots: &RootClients) -> u64 {
    let mut names: Vec<&str> = roots.iter().map(|(t, _)| t.name.as_str()).collect();
    names.sort_unstable();
    fnv1a_hash(names.join(",").as_bytes())
}

/// Fisher–Yates shuffle driven by `seed`
pub(crate) fn shuffle<T>(items: &mut [T], seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for i in (1..items.len()).rev() {
        let j = rng.gen_range(0..=i);
        items.swap(i, j);
    }
}

/// Root units in the order `strategy` dispatches them
pub(crate) fn ordered_roots(strategy: Strategy, roots: &RootClients) -> Vec<WorkUnit> {
    match strategy {
        Strategy::Dfs | Strategy::PriorityQueue => depth_first_order(roots),
        Strategy::RoundRobin | Strategy::RandomQueue => round_robin_interleave(roots),
        Strategy::Shuffle => {
            let mut units = round_robin_interleave(roots);
            shuffle(&mut units, shuffle_seed(roots));
            units
        }
    }
}

/// Keep the `num`-th of `total` contiguous chunks.
///
/// Chunks hold `len / total` items (at least one); the last shard also takes
/// any remainder, so the union of all shards is the input exactly once.
pub fn shard_items<T>(items: Vec<T>, shard: Option<Shard>) -> Vec<T> {
    let Some(Shard { num, total }) = shard else {
        return items;
    };
    if num == 0 || total == 0 || items.is_empty() {
        return Vec::new();
    }
    let chunk_size = (items.len() / total).max(1);
    let chunks = items.len().div_ceil(chunk_size);
    if num > chunks {
        return Vec::new();
    }
    let start = (num - 1) * chunk_size;
    let end = if chunks > total && num == total {
        items.len()
    } else {
        (start + chunk_size).min(items.len())
    };
    items.into_iter().skip(start).take(end - start).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestClient;
    use proptest::prelude::*;
    use super::Strategy;

    fn roots(layout: &[(&str, &[&str])]) -> RootClients {
        layout.iter()
            .map(|(table, clients)| {
                (
                    Table::new(*table).build(),
                    clients.iter().map(|c| TestClient::arc(*c)).collect(),
                )
            })
            .collect()
    }

    fn labels(units: &[WorkUnit]) -> Vec<String> {
        units
            .iter()
            .map(|u| format!("{}/{}", u.table.name, u.client.id()))
            .collect()
    }

    #[test]
    fn test_round_robin_interleave() {
        let roots = roots(&[("t1", &["a", "b", "c"]), ("t2", &["a"]), ("t3", &["a", "b"])]);
        assert_eq!(
            labels(&round_robin_interleave(&roots)),
            vec!["t1/a", "t2/a", "t3/a", "t1/b", "t3/b", "t1/c"]
        );
        assert_eq!(
            labels(&depth_first_order(&roots)),
            vec!["t1/a", "t1/b", "t1/c", "t2/a", "t3/a", "t3/b"]
        );
    }

    #[test]
    fn test_shuffle_is_deterministic_per_table_set() {
        let a = roots(&[("t1", &["a", "b"]), ("t2", &["a", "b"]), ("t3", &["a", "b"])]);
        let reordered = roots(&[("t3", &["a", "b"]), ("t1", &["a", "b"]), ("t2", &["a", "b"])]);
        let other = roots(&[("t1", &["a", "b"]), ("t2", &["a", "b"]), ("t4", &["a", "b"])]);

        assert_eq!(shuffle_seed(&a), shuffle_seed(&reordered));
        assert_ne!(shuffle_seed(&a), shuffle_seed(&other));

        let first = labels(&ordered_roots(Strategy::Shuffle, &a));
        let second = labels(&ordered_roots(Strategy::Shuffle, &a));
        assert_eq!(first, second);

        let mut sorted = first.clone();
        sorted.sort();
        let mut expected = labels(&round_robin_interleave(&a));
        expected.sort();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn test_multiplex_dedup() {
        let table = Table::new("t").with_multiplex(|_| {
            vec![TestClient::arc("x"), TestClient::arc("y"), TestClient::arc("x")]
        });
        let clients = multiplex_clients(&table, &TestClient::arc("root"));
        let ids: Vec<_> = clients.iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, vec!["x", "y"]);

        let plain = multiplex_clients(&Table::new("p"), &TestClient::arc("root"));
        assert_eq!(plain[0].id(), "root");
    }

    #[test]
    fn test_shard_examples() {
        let items: Vec<u32> = (1..=10).collect();
        let shard = |num, total| shard_items(items.clone(), Some(Shard { num, total }));
        assert_eq!(shard(1, 3), vec![1, 2, 3]);
        assert_eq!(shard(2, 3), vec![4, 5, 6]);
        assert_eq!(shard(3, 3), vec![7, 8, 9, 10]);
        assert_eq!(shard_items(items.clone(), None), items);

        let few = vec![1, 2];
        assert_eq!(shard_items(few.clone(), Some(Shard { num: 2, total: 3 })), vec![2]);
        assert!(shard_items(few, Some(Shard { num: 3, total: 3 })).is_empty());
    }

    proptest! {
        #[test]
        fn prop_shards_partition_items(len in 0usize..200, total in 1usize..12) {
            let items: Vec<usize> = (0..len).collect();
            let mut union = Vec::new();
            for num in 1..=total {
                union.extend(shard_items(items.clone(), Some(Shard { num, total })));
            }
            prop_assert_eq!(union, items);
        }

        #[test]
        fn prop_interleave_keeps_every_pair(counts in proptest::collection::vec(0usize..5, 1..6)) {
            let roots: RootClients = counts
                .iter()
                .enumerate()
                .map(|(i, n)| {
                    let clients = (0..*n).map(|c| TestClient::arc(&format!("c{c}"))).collect();
                    (Table::new(format!("t{i}")).build(), clients)
                })
                .collect();
            let mut interleaved = labels(&round_robin_interleave(&roots));
            let mut plain = labels(&depth_first_order(&roots));
            prop_assert_eq!(interleaved.len(), counts.iter().sum::<usize>());
            interleaved.sort();
            plain.sort();
            prop_assert_eq!(interleaved, plain);
        }
    }
}
