//! Per-table batching of resolved resources
//!
//! ```text
//! process(resource) ──▶ workers[table] ──▶ TableBatch ──flush──▶ SyncMessage::Insert
//!                            ▲
//!                 max_rows | max_bytes | timeout | flush()
//! ```
//!
//! Each table gets its own worker task, created lazily on the first resource
//! for that table. Workers own their record builder, so nothing on the data
//! path is shared between tables.

use crate::codec::RecordBuilder;
use crate::config::BatchSettings;
use crate::message::SyncMessage;
use crate::schema::{Resource, Table};
use arrow_array::RecordBatch;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

enum WorkerMessage {
    Resource(Arc<Resource>),
    Flush(oneshot::Sender<()>),
}

/// Rows of one table accumulated since the last flush
struct TableBatch {
    builder: RecordBuilder,
    bytes: usize,
    max_rows: usize,
    max_bytes: usize,
}

impl TableBatch {
    fn new(table: &Table, settings: &BatchSettings) -> Self {
        Self {
            builder: RecordBuilder::new(table),
            bytes: 0,
            max_rows: settings.max_rows.max(1),
            max_bytes: settings.max_bytes,
        }
    }

    fn len(&self) -> usize {
        self.builder.len()
    }

    fn is_empty(&self) -> bool {
        self.builder.is_empty()
    }

    /// Whether adding `size` bytes would push a non-empty batch over the limit
    fn would_overflow(&self, size: usize) -> bool {
        !self.is_empty() && self.max_bytes > 0 && self.bytes + size > self.max_bytes
    }

    fn is_full(&self) -> bool {
        self.len() >= self.max_rows || (self.max_bytes > 0 && self.bytes >= self.max_bytes)
    }

    fn add(&mut self, resource: &Resource) -> bool {
        let size = resource.estimated_size();
        match self.builder.append(&resource.record_values()) {
            Ok(()) => {
                self.bytes += size;
                true
            }
            Err(e) => {
                warn!(
                    table = %resource.table().name,
                    error = %e,
                    "Dropping resource that does not fit the table schema"
                );
                false
            }
        }
    }

    fn take(&mut self) -> Option<RecordBatch> {
        if self.is_empty() {
            return None;
        }
        self.bytes = 0;
        match self.builder.finish() {
            Ok(record) => Some(record),
            Err(e) => {
                error!(error = %e, "Failed to build record batch");
                None
            }
        }
    }
}

/// Groups resolved resources into per-table record batches
pub struct Batcher {
    settings: BatchSettings,
    output: mpsc::Sender<SyncMessage>,
    workers: DashMap<String, mpsc::Sender<WorkerMessage>>,
    tasks: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
}

impl Batcher {
    /// Workers stop emitting once `cancel` fires. A closed `output` trips
    /// `cancel` so the rest of the sync winds down too.
    pub fn new(
        settings: BatchSettings,
        output: mpsc::Sender<SyncMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            output,
            workers: DashMap::new(),
            tasks: Mutex::new(JoinSet::new()),
            cancel,
        }
    }

    /// Hand a resource to its table's worker
    pub async fn process(&self, resource: Arc<Resource>) {
        let tx = self.worker(resource.table());
        if tx.send(WorkerMessage::Resource(resource)).await.is_err() {
            debug!("Batch worker gone, dropping resource");
        }
    }

    /// Sender of the table's worker, spawning it on first use.
    ///
    /// Two callers may race to create the same worker: the loser's channel
    /// is dropped before its worker is spawned and it uses the winner's.
    fn worker(&self, table: &Arc<Table>) -> mpsc::Sender<WorkerMessage> {
        if let Some(tx) = self.workers.get(&table.name).map(|e| e.value().clone()) {
            return tx;
        }

        let (tx, rx) = mpsc::channel(self.settings.max_rows.max(1));
        match self.workers.entry(table.name.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                slot.insert(tx.clone());
                let worker = run_worker(
                    Arc::clone(table),
                    rx,
                    self.output.clone(),
                    self.settings.clone(),
                    self.cancel.clone(),
                );
                self.tasks.lock().spawn(worker);
                tx
            }
        }
    }

    /// Flush every worker and wait until each has emitted its rows
    pub async fn flush(&self) {
        let senders: Vec<_> = self.workers.iter().map(|e| e.value().clone()).collect();
        let mut pending = Vec::with_capacity(senders.len());
        for tx in senders {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(WorkerMessage::Flush(done_tx)).await.is_ok() {
                pending.push(done_rx);
            }
        }
        for done in pending {
            let _ = done.await;
        }
    }

    /// Flush everything and stop all workers
    pub async fn close(&self) {
        self.flush().await;
        self.workers.clear();

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Batch worker failed");
            }
        }
    }
}

async fn run_worker(
    table: Arc<Table>,
    mut rx: mpsc::Receiver<WorkerMessage>,
    output: mpsc::Sender<SyncMessage>,
    settings: BatchSettings,
    cancel: CancellationToken,
) {
    let mut batch = TableBatch::new(&table, &settings);
    let timeout = settings.timeout();
    let timer = sleep_until(Instant::now() + timeout);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            biased;

            message = rx.recv() => match message {
                Some(WorkerMessage::Resource(resource)) => {
                    if batch.would_overflow(resource.estimated_size()) {
                        emit(&table, batch.take(), &output, &cancel).await;
                    }
                    let was_empty = batch.is_empty();
                    if batch.add(&resource) && was_empty {
                        timer.as_mut().reset(Instant::now() + timeout);
                    }
                    if batch.is_full() {
                        emit(&table, batch.take(), &output, &cancel).await;
                    }
                }
                Some(WorkerMessage::Flush(done)) => {
                    emit(&table, batch.take(), &output, &cancel).await;
                    let _ = done.send(());
                }
                None => {
                    emit(&table, batch.take(), &output, &cancel).await;
                    break;
                }
            },

            () = &mut timer, if !batch.is_empty() => {
                emit(&table, batch.take(), &output, &cancel).await;
            }
        }
    }
}

async fn emit(
    table: &Table,
    record: Option<RecordBatch>,
    output: &mpsc::Sender<SyncMessage>,
    cancel: &CancellationToken,
) {
    let Some(record) = record else {
        return;
    };
    let rows = record.num_rows();
    let message = SyncMessage::Insert {
        table_name: table.name.clone(),
        record,
    };
    tokio::select! {
        sent = output.send(message) => {
            if sent.is_err() {
                warn!(table = %table.name, rows, "Output channel closed, stopping sync");
                cancel.cancel();
            }
        }
        () = cancel.cancelled() => {
            debug!(table = %table.name, rows, "Sync cancelled, dropping batch");
        }
    }
}
