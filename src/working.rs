//! Working memory
//!
//! Bounded in-RAM buffer for short-lived memories, keyed by
//! `(expires_at, id)` for ordered eviction. Items expire after a TTL and
//! are silently dropped unless marked as consolidation candidates, in
//! which case the consolidator may promote them to durable storage
//! first.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use crate::telemetry::{events, no_measurements, TelemetrySink};
use crate::types::{EngramCategory, WorkingMemoryConfig};

/// A short-lived memory item, engram-shaped plus session bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingItem {
    pub id: String,
    pub content: String,
    pub category: EngramCategory,
    pub importance: f32,
    pub metadata: HashMap<String, serde_json::Value>,
    pub session_id: Option<String>,
    pub source: Option<String>,
    pub tool_name: Option<String>,
    pub access_count: i64,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consolidation_candidate: bool,
}

/// Input for storing a working-memory item
#[derive(Debug, Clone, Default)]
pub struct StoreWorkingInput {
    pub content: String,
    pub category: EngramCategory,
    pub importance: Option<f32>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub session_id: Option<String>,
    pub source: Option<String>,
    pub tool_name: Option<String>,
    /// Per-item TTL override in seconds
    pub ttl_seconds: Option<u64>,
    pub consolidation_candidate: bool,
}

/// Working-memory statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkingMemoryStats {
    pub items: usize,
    pub capacity: usize,
    pub consolidation_candidates: usize,
    pub stored_total: u64,
    pub evicted_total: u64,
    pub expired_total: u64,
}

struct WorkingState {
    items: HashMap<String, WorkingItem>,
    /// Eviction order index
    expiry: BTreeSet<(DateTime<Utc>, String)>,
    stored_total: u64,
    evicted_total: u64,
    expired_total: u64,
}

/// Bounded TTL-expired in-RAM store
pub struct WorkingMemory {
    state: Mutex<WorkingState>,
    config: WorkingMemoryConfig,
    telemetry: Arc<dyn TelemetrySink>,
}

impl WorkingMemory {
    pub fn new(config: WorkingMemoryConfig, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            state: Mutex::new(WorkingState {
                items: HashMap::new(),
                expiry: BTreeSet::new(),
                stored_total: 0,
                evicted_total: 0,
                expired_total: 0,
            }),
            config,
            telemetry,
        }
    }

    /// Store an item, evicting the oldest by expiry order on overflow
    pub fn store(&self, input: StoreWorkingInput) -> WorkingItem {
        let now = Utc::now();
        let ttl = input.ttl_seconds.unwrap_or(self.config.ttl_seconds);
        let item = WorkingItem {
            id: Uuid::new_v4().to_string(),
            content: input.content,
            category: input.category,
            importance: input.importance.unwrap_or(0.5).clamp(0.0, 1.0),
            metadata: input.metadata,
            session_id: input.session_id,
            source: input.source,
            tool_name: input.tool_name,
            access_count: 0,
            created_at: now,
            accessed_at: now,
            expires_at: now + ChronoDuration::seconds(ttl as i64),
            consolidation_candidate: input.consolidation_candidate,
        };

        let mut state = self.state.lock();
        while state.items.len() >= self.config.max_items {
            if let Some(&(expires, ref id)) = state.expiry.iter().next() {
                let id = id.clone();
                state.expiry.remove(&(expires, id.clone()));
                state.items.remove(&id);
                state.evicted_total += 1;
                self.telemetry.emit(
                    events::WORKING_EVICTED,
                    &no_measurements(),
                    &serde_json::json!({ "id": id }),
                );
            } else {
                break;
            }
        }

        state.expiry.insert((item.expires_at, item.id.clone()));
        state.items.insert(item.id.clone(), item.clone());
        state.stored_total += 1;
        drop(state);

        self.telemetry.emit(
            events::WORKING_STORED,
            &no_measurements(),
            &serde_json::json!({ "id": item.id }),
        );
        item
    }

    /// Fetch an item, bumping its access bookkeeping
    ///
    /// A read that meets an expired item drops it and reports a miss.
    pub fn get(&self, id: &str) -> Option<WorkingItem> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let expired = match state.items.get(id) {
            Some(item) => item.expires_at <= now,
            None => return None,
        };
        if expired {
            if let Some(item) = state.items.remove(id) {
                state.expiry.remove(&(item.expires_at, item.id));
                state.expired_total += 1;
            }
            return None;
        }

        let item = state.items.get_mut(id)?;
        item.accessed_at = now;
        item.access_count += 1;
        let snapshot = item.clone();
        drop(state);

        self.telemetry.emit(
            events::WORKING_RETRIEVED,
            &no_measurements(),
            &serde_json::json!({ "id": id }),
        );
        Some(snapshot)
    }

    /// Case-insensitive substring search over live items
    pub fn search(&self, query: &str, limit: usize) -> Vec<WorkingItem> {
        let needle = query.to_lowercase();
        let now = Utc::now();
        let state = self.state.lock();
        let mut hits: Vec<WorkingItem> = state
            .items
            .values()
            .filter(|item| item.expires_at > now)
            .filter(|item| item.content.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        hits.truncate(limit);
        hits
    }

    /// Most recently created live items
    pub fn get_recent(&self, limit: usize) -> Vec<WorkingItem> {
        let now = Utc::now();
        let state = self.state.lock();
        let mut items: Vec<WorkingItem> = state
            .items
            .values()
            .filter(|item| item.expires_at > now)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(limit);
        items
    }

    /// Mark an item for consolidation
    pub fn mark_for_consolidation(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        match state.items.get_mut(id) {
            Some(item) => {
                item.consolidation_candidate = true;
                true
            }
            None => false,
        }
    }

    /// Live consolidation candidates at least `min_age` old
    pub fn get_consolidation_candidates(
        &self,
        min_age: std::time::Duration,
        limit: usize,
    ) -> Vec<WorkingItem> {
        let now = Utc::now();
        let cutoff = now - ChronoDuration::from_std(min_age).unwrap_or_default();
        let state = self.state.lock();
        let mut candidates: Vec<WorkingItem> = state
            .items
            .values()
            .filter(|item| item.consolidation_candidate)
            .filter(|item| item.expires_at > now)
            .filter(|item| item.created_at <= cutoff)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        candidates.truncate(limit);
        candidates
    }

    /// Remove an item
    pub fn delete(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        match state.items.remove(id) {
            Some(item) => {
                state.expiry.remove(&(item.expires_at, item.id));
                true
            }
            None => false,
        }
    }

    /// Drop every item belonging to a session
    pub fn clear_session(&self, session_id: &str) -> usize {
        let mut state = self.state.lock();
        let doomed: Vec<(DateTime<Utc>, String)> = state
            .items
            .values()
            .filter(|item| item.session_id.as_deref() == Some(session_id))
            .map(|item| (item.expires_at, item.id.clone()))
            .collect();
        for (expires, id) in &doomed {
            state.items.remove(id);
            state.expiry.remove(&(*expires, id.clone()));
        }
        doomed.len()
    }

    /// Remove expired items; called on a timer and lazily by reads
    pub fn clear_expired(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.lock();
        let doomed: Vec<(DateTime<Utc>, String)> = state
            .expiry
            .iter()
            .take_while(|(expires, _)| *expires <= now)
            .cloned()
            .collect();
        for (expires, id) in &doomed {
            state.items.remove(id);
            state.expiry.remove(&(*expires, id.clone()));
            state.expired_total += 1;
        }
        drop(state);

        if !doomed.is_empty() {
            let mut measurements = HashMap::new();
            measurements.insert("expired".to_string(), doomed.len() as f64);
            self.telemetry.emit(
                events::WORKING_EXPIRED,
                &measurements,
                &serde_json::Value::Null,
            );
        }
        doomed.len()
    }

    /// Current statistics
    pub fn stats(&self) -> WorkingMemoryStats {
        let state = self.state.lock();
        WorkingMemoryStats {
            items: state.items.len(),
            capacity: self.config.max_items,
            consolidation_candidates: state
                .items
                .values()
                .filter(|i| i.consolidation_candidate)
                .count(),
            stored_total: state.stored_total,
            evicted_total: state.evicted_total,
            expired_total: state.expired_total,
        }
    }

    /// Run the periodic expiry sweep
    pub fn spawn_expiry_sweeper(
        self: Arc<Self>,
        interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.clear_expired();
            }
        })
    }
}
