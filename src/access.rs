//! Access tracker
//!
//! Buffers access events and flushes them to the store in batches, so
//! the retrieval path never blocks on counter writes. Semantics are
//! at-least-once within the current buffer: a buffer lost to a crash is
//! acceptable and the engine remains correct with dropped updates.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::Result;
use crate::storage::{queries, EngramStore};
use crate::telemetry::{events, TelemetrySink};
use crate::types::EngramId;

/// Default flush interval
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Pending-entry count that triggers an auto-flush
pub const AUTO_FLUSH_THRESHOLD: usize = 100;

/// Buffered access-count tracker
pub struct AccessTracker {
    store: EngramStore,
    pending: DashMap<EngramId, i64>,
    notify: Arc<Notify>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl AccessTracker {
    pub fn new(store: EngramStore, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            store,
            pending: DashMap::new(),
            notify: Arc::new(Notify::new()),
            telemetry,
        }
    }

    /// Record one access; non-blocking
    pub fn track(&self, id: EngramId) {
        *self.pending.entry(id).or_insert(0) += 1;
        if self.pending.len() >= AUTO_FLUSH_THRESHOLD {
            self.notify.notify_one();
        }
    }

    /// Record one access for each id
    pub fn track_many(&self, ids: &[EngramId]) {
        for &id in ids {
            self.track(id);
        }
    }

    /// Number of ids with buffered increments
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Flush buffered increments, one batched update per increment value
    pub fn flush(&self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        // Drain the buffer; entries added after this point wait for the
        // next flush
        let drained: Vec<(EngramId, i64)> = {
            let keys: Vec<EngramId> = self.pending.iter().map(|e| *e.key()).collect();
            keys.into_iter()
                .filter_map(|k| self.pending.remove(&k))
                .collect()
        };

        let mut groups: HashMap<i64, Vec<EngramId>> = HashMap::new();
        for (id, increment) in drained {
            groups.entry(increment).or_default().push(id);
        }

        let now = Utc::now();
        let mut flushed = 0usize;
        for (increment, ids) in groups {
            flushed += self
                .store
                .with_connection(|conn| queries::batch_touch(conn, &ids, increment, now))?;
        }

        let mut measurements = HashMap::new();
        measurements.insert("flushed".to_string(), flushed as f64);
        self.telemetry.emit(
            events::ACCESS_TRACKED,
            &measurements,
            &serde_json::Value::Null,
        );

        Ok(flushed)
    }

    /// Run the periodic flusher; also wakes on auto-flush notifications
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let notify = self.notify.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = notify.notified() => {}
                }
                if let Err(e) = self.flush() {
                    tracing::warn!("access flush failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queries::{create_engram, get_engram};
    use crate::telemetry::MemorySink;
    use crate::types::{CreateEngramInput, EngramCategory};

    fn setup() -> (EngramStore, Arc<MemorySink>, EngramId) {
        let store = EngramStore::open_in_memory().unwrap();
        let id = store
            .with_connection(|conn| {
                let engram = create_engram(
                    conn,
                    &CreateEngramInput {
                        content: "tracked".to_string(),
                        category: EngramCategory::Fact,
                        ..Default::default()
                    },
                )?;
                Ok(engram.id)
            })
            .unwrap();
        (store, Arc::new(MemorySink::new()), id)
    }

    #[test]
    fn test_track_and_flush() {
        let (store, sink, id) = setup();
        let tracker = AccessTracker::new(store.clone(), sink.clone());

        tracker.track(id);
        tracker.track(id);
        tracker.track(id);
        assert_eq!(tracker.pending_len(), 1);

        let flushed = tracker.flush().unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(tracker.pending_len(), 0);

        let engram = store
            .with_connection(|conn| get_engram(conn, id))
            .unwrap();
        assert_eq!(engram.access_count, 3);
        assert!(engram.last_accessed_at.is_some());
        assert_eq!(sink.count(events::ACCESS_TRACKED), 1);
    }

    #[test]
    fn test_groups_by_increment() {
        let (store, sink, a) = setup();
        let b = store
            .with_connection(|conn| {
                Ok(create_engram(
                    conn,
                    &CreateEngramInput {
                        content: "other".to_string(),
                        category: EngramCategory::Fact,
                        ..Default::default()
                    },
                )?
                .id)
            })
            .unwrap();

        let tracker = AccessTracker::new(store.clone(), sink);
        tracker.track(a);
        tracker.track(a);
        tracker.track(b);

        tracker.flush().unwrap();

        let (count_a, count_b) = store
            .with_connection(|conn| {
                Ok((
                    get_engram(conn, a)?.access_count,
                    get_engram(conn, b)?.access_count,
                ))
            })
            .unwrap();
        assert_eq!(count_a, 2);
        assert_eq!(count_b, 1);
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let (store, sink, _) = setup();
        let tracker = AccessTracker::new(store, sink.clone());
        assert_eq!(tracker.flush().unwrap(), 0);
        assert_eq!(sink.count(events::ACCESS_TRACKED), 0);
    }

    #[test]
    fn test_missing_id_does_not_fail_flush() {
        let (store, sink, _) = setup();
        let tracker = AccessTracker::new(store, sink);
        tracker.track(999_999);
        // UPDATE matches zero rows; flush succeeds
        assert_eq!(tracker.flush().unwrap(), 0);
    }
}
