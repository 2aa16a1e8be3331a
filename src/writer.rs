//! Write serializer
//!
//! All mutating operations against the engram store funnel through a
//! single writer thread with FIFO queuing; reads bypass it. Callers
//! block (asynchronously) until their write completes, up to a timeout.
//! If the writer is unreachable the caller falls back to a direct write,
//! which is still atomic per operation.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::cell::Cell;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use crate::error::{LimbicError, Result};
use crate::storage::{queries, EngramStore};
use crate::types::{CreateEngramInput, Engram, EngramId, UpdateEngramInput};

/// Write timeout before the caller gives up
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

thread_local! {
    /// Set while this thread executes a serialized transaction. Nested
    /// calls detect it and run their callback directly instead of
    /// enqueueing, which would self-deadlock.
    static IN_SERIALIZED_TXN: Cell<bool> = const { Cell::new(false) };
}

struct TxnFlagGuard;

impl TxnFlagGuard {
    fn enter() -> Self {
        IN_SERIALIZED_TXN.with(|f| f.set(true));
        TxnFlagGuard
    }
}

impl Drop for TxnFlagGuard {
    fn drop(&mut self) {
        IN_SERIALIZED_TXN.with(|f| f.set(false));
    }
}

/// True iff the current thread is inside a serialized transaction
pub fn in_serialized_transaction() -> bool {
    IN_SERIALIZED_TXN.with(|f| f.get())
}

type WriteJob = Box<dyn FnOnce(&EngramStore) + Send>;

#[derive(Default)]
struct Counters {
    writes: AtomicU64,
    errors: AtomicU64,
    last_write_micros: AtomicI64,
}

/// Serializer statistics
#[derive(Debug, Clone, Serialize)]
pub struct WriterStats {
    pub total_writes: u64,
    pub total_errors: u64,
    pub last_write_at: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
}

/// Single-writer funnel for all store mutations
pub struct WriteSerializer {
    tx: mpsc::UnboundedSender<WriteJob>,
    store: EngramStore,
    counters: Arc<Counters>,
    started: Instant,
}

impl WriteSerializer {
    /// Start the writer thread over a store handle
    pub fn start(store: EngramStore) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();
        let worker_store = store.clone();

        std::thread::Builder::new()
            .name("limbic-writer".to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    let _guard = TxnFlagGuard::enter();
                    job(&worker_store);
                }
            })
            .expect("failed to spawn writer thread");

        Arc::new(Self {
            tx,
            store,
            counters: Arc::new(Counters::default()),
            started: Instant::now(),
        })
    }

    fn record(&self, ok: bool) {
        if ok {
            self.counters.writes.fetch_add(1, Ordering::Relaxed);
            self.counters
                .last_write_micros
                .store(Utc::now().timestamp_micros(), Ordering::Relaxed);
        } else {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Run a job through the writer, falling back to a direct call when
    /// the writer is unreachable and failing with `WriteTimeout` when it
    /// does not answer in time.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&EngramStore) -> Result<T> + Send + 'static,
    {
        // Already inside the serialized transaction on this thread:
        // execute directly to avoid self-deadlock.
        if in_serialized_transaction() {
            let result = f(&self.store);
            self.record(result.is_ok());
            return result;
        }

        let (reply_tx, reply_rx) = oneshot::channel::<Result<T>>();
        let job: WriteJob = Box::new(move |store| {
            let _ = reply_tx.send(f(store));
        });

        if let Err(send_error) = self.tx.send(job) {
            // Writer gone: direct write, atomic per operation
            tracing::warn!("write serializer unreachable, falling back to direct write");
            (send_error.0)(&self.store);
            // The job already sent its result through the oneshot
            return match reply_rx.await {
                Ok(result) => {
                    self.record(result.is_ok());
                    result
                }
                Err(_) => Err(LimbicError::Internal(
                    "direct write produced no result".into(),
                )),
            };
        }

        match tokio::time::timeout(WRITE_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => {
                self.record(result.is_ok());
                result
            }
            Ok(Err(_)) => {
                self.record(false);
                Err(LimbicError::Internal("writer dropped the request".into()))
            }
            Err(_) => {
                self.record(false);
                Err(LimbicError::WriteTimeout(WRITE_TIMEOUT.as_secs()))
            }
        }
    }

    /// Insert one engram
    pub async fn insert(&self, input: CreateEngramInput) -> Result<Engram> {
        self.run(move |store| store.with_transaction(|conn| queries::create_engram(conn, &input)))
            .await
    }

    /// Insert a batch atomically
    pub async fn insert_all(&self, inputs: Vec<CreateEngramInput>) -> Result<Vec<Engram>> {
        self.run(move |store| {
            store.with_transaction(|conn| {
                inputs
                    .iter()
                    .map(|input| queries::create_engram(conn, input))
                    .collect()
            })
        })
        .await
    }

    /// Update one engram
    pub async fn update(&self, id: EngramId, input: UpdateEngramInput) -> Result<Engram> {
        self.run(move |store| store.with_transaction(|conn| queries::update_engram(conn, id, &input)))
            .await
    }

    /// Delete one engram
    pub async fn delete(&self, id: EngramId) -> Result<bool> {
        self.run(move |store| store.with_transaction(|conn| queries::delete_engram(conn, id)))
            .await
    }

    /// Delete a batch atomically
    pub async fn delete_all(&self, ids: Vec<EngramId>) -> Result<usize> {
        self.run(move |store| store.with_transaction(|conn| queries::delete_engrams(conn, &ids)))
            .await
    }

    /// Run an arbitrary mutation inside a serialized transaction
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        self.run(move |store| store.with_transaction(f)).await
    }

    /// Synchronous variant for code already running inside a serialized
    /// transaction (detected via the thread-local flag). The callback
    /// joins the enclosing transaction instead of opening a new one.
    pub fn transaction_blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        if in_serialized_transaction() {
            let result = self.store.with_connection(|conn| f(conn));
            self.record(result.is_ok());
            result
        } else {
            let result = self.store.with_transaction(f);
            self.record(result.is_ok());
            result
        }
    }

    /// Serializer statistics
    pub fn stats(&self) -> WriterStats {
        let micros = self.counters.last_write_micros.load(Ordering::Relaxed);
        WriterStats {
            total_writes: self.counters.writes.load(Ordering::Relaxed),
            total_errors: self.counters.errors.load(Ordering::Relaxed),
            last_write_at: (micros > 0).then(|| DateTime::from_timestamp_micros(micros)).flatten(),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }
}
