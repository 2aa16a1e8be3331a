//! Usage feedback
//!
//! Tracks retrieval counts and usefulness signals per engram, stored in
//! the engram's metadata. Retrieval increments are buffered and flushed
//! periodically; helpfulness adjustments apply immediately.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::storage::{queries, EngramStore};
use crate::types::EngramId;

/// Flush interval for buffered retrieval counts
pub const RETRIEVAL_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Helpfulness delta on a useful signal
const USEFUL_DELTA: f64 = 0.05;

/// Helpfulness delta on a noise signal
const NOISE_DELTA: f64 = -0.03;

/// Bounded per-engram signal history length
const HISTORY_LIMIT: usize = 50;

/// Metadata keys used by the feedback store
mod keys {
    pub const RETRIEVAL_COUNT: &str = "retrieval_count";
    pub const HELPFULNESS: &str = "helpfulness_score";
    pub const HISTORY: &str = "feedback_history";
}

/// Per-engram usage feedback tracker
pub struct UsageFeedback {
    store: EngramStore,
    pending_retrievals: DashMap<EngramId, i64>,
}

impl UsageFeedback {
    pub fn new(store: EngramStore) -> Self {
        Self {
            store,
            pending_retrievals: DashMap::new(),
        }
    }

    /// Buffer a retrieval event for each id
    pub fn on_retrieved(&self, ids: &[EngramId]) {
        for &id in ids {
            *self.pending_retrievals.entry(id).or_insert(0) += 1;
        }
    }

    /// Flush buffered retrieval counts into metadata
    pub fn flush_retrievals(&self) -> Result<usize> {
        let drained: Vec<(EngramId, i64)> = {
            let keys: Vec<EngramId> = self.pending_retrievals.iter().map(|e| *e.key()).collect();
            keys.into_iter()
                .filter_map(|k| self.pending_retrievals.remove(&k))
                .collect()
        };

        let mut flushed = 0usize;
        for (id, increment) in drained {
            let result = self.store.with_connection(|conn| {
                let engram = match queries::get_engram(conn, id) {
                    Ok(engram) => engram,
                    // Forgotten between retrieval and flush; drop silently
                    Err(_) => return Ok(false),
                };
                let current = engram
                    .metadata
                    .get(keys::RETRIEVAL_COUNT)
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                let mut patch = HashMap::new();
                patch.insert(keys::RETRIEVAL_COUNT.to_string(), json!(current + increment));
                queries::merge_metadata(conn, id, &patch)?;
                Ok(true)
            })?;
            if result {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Record a usefulness signal: helpfulness moves up by 0.05
    pub fn signal_useful(&self, id: EngramId, session: Option<&str>) -> Result<f64> {
        self.apply_signal(id, "useful", USEFUL_DELTA, session)
    }

    /// Record a noise signal: helpfulness moves down by 0.03
    pub fn signal_noise(&self, id: EngramId, session: Option<&str>) -> Result<f64> {
        self.apply_signal(id, "noise", NOISE_DELTA, session)
    }

    fn apply_signal(
        &self,
        id: EngramId,
        signal: &str,
        delta: f64,
        session: Option<&str>,
    ) -> Result<f64> {
        self.store.with_connection(|conn| {
            let engram = queries::get_engram(conn, id)?;

            let current = engram
                .metadata
                .get(keys::HELPFULNESS)
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5);
            let updated = (current + delta).clamp(0.0, 1.0);

            let mut history: Vec<serde_json::Value> = engram
                .metadata
                .get(keys::HISTORY)
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default();
            history.push(json!({
                "signal": signal,
                "session": session,
                "at": queries::format_ts(Utc::now()),
            }));
            if history.len() > HISTORY_LIMIT {
                let overflow = history.len() - HISTORY_LIMIT;
                history.drain(..overflow);
            }

            let mut patch = HashMap::new();
            patch.insert(keys::HELPFULNESS.to_string(), json!(updated));
            patch.insert(keys::HISTORY.to_string(), json!(history));
            queries::merge_metadata(conn, id, &patch)?;

            Ok(updated)
        })
    }

    /// Helpfulness for an engram (default 0.5)
    pub fn helpfulness(&self, id: EngramId) -> Result<f64> {
        self.store.with_connection(|conn| {
            let engram = queries::get_engram(conn, id)?;
            Ok(engram
                .metadata
                .get(keys::HELPFULNESS)
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5))
        })
    }

    /// Ranking hook: similarity scaled by `0.5 + helpfulness`, a
    /// multiplier in [0.5, 1.5]
    pub fn adjust_similarity(&self, similarity: f32, id: EngramId) -> f32 {
        let helpfulness = self.helpfulness(id).unwrap_or(0.5);
        similarity * (0.5 + helpfulness as f32)
    }

    /// Buffered ids awaiting a flush
    pub fn pending_len(&self) -> usize {
        self.pending_retrievals.len()
    }

    /// Run the periodic retrieval-count flusher
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETRIEVAL_FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.flush_retrievals() {
                    tracing::warn!("feedback flush failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CreateEngramInput, EngramCategory};

    fn setup() -> (UsageFeedback, EngramStore, EngramId) {
        let store = EngramStore::open_in_memory().unwrap();
        let id = store
            .with_connection(|conn| {
                Ok(queries::create_engram(
                    conn,
                    &CreateEngramInput {
                        content: "feedback target".to_string(),
                        category: EngramCategory::Fact,
                        ..Default::default()
                    },
                )?
                .id)
            })
            .unwrap();
        (UsageFeedback::new(store.clone()), store, id)
    }

    #[test]
    fn test_retrieval_counts_flush() {
        let (feedback, store, id) = setup();
        feedback.on_retrieved(&[id]);
        feedback.on_retrieved(&[id]);
        assert_eq!(feedback.pending_len(), 1);

        assert_eq!(feedback.flush_retrievals().unwrap(), 1);
        assert_eq!(feedback.pending_len(), 0);

        let engram = store
            .with_connection(|conn| queries::get_engram(conn, id))
            .unwrap();
        assert_eq!(
            engram.metadata.get("retrieval_count").and_then(|v| v.as_i64()),
            Some(2)
        );
    }

    #[test]
    fn test_useful_and_noise_signals() {
        let (feedback, _, id) = setup();

        assert!((feedback.signal_useful(id, Some("s1")).unwrap() - 0.55).abs() < 1e-9);
        assert!((feedback.signal_noise(id, Some("s1")).unwrap() - 0.52).abs() < 1e-9);
        assert!((feedback.helpfulness(id).unwrap() - 0.52).abs() < 1e-9);
    }

    #[test]
    fn test_helpfulness_clamped() {
        let (feedback, _, id) = setup();
        for _ in 0..30 {
            feedback.signal_useful(id, None).unwrap();
        }
        assert_eq!(feedback.helpfulness(id).unwrap(), 1.0);

        for _ in 0..60 {
            feedback.signal_noise(id, None).unwrap();
        }
        assert!(feedback.helpfulness(id).unwrap() >= 0.0);
    }

    #[test]
    fn test_adjust_similarity_multiplier_range() {
        let (feedback, _, id) = setup();

        // Default helpfulness 0.5 => multiplier 1.0
        assert!((feedback.adjust_similarity(0.8, id) - 0.8).abs() < 1e-6);

        for _ in 0..30 {
            feedback.signal_useful(id, None).unwrap();
        }
        // Max helpfulness => multiplier 1.5
        assert!((feedback.adjust_similarity(0.8, id) - 1.2).abs() < 1e-6);

        // Unknown engram falls back to the neutral multiplier
        assert!((feedback.adjust_similarity(0.8, 999_999) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_history_bounded() {
        let (feedback, store, id) = setup();
        for _ in 0..(HISTORY_LIMIT + 20) {
            feedback.signal_useful(id, None).unwrap();
        }

        let engram = store
            .with_connection(|conn| queries::get_engram(conn, id))
            .unwrap();
        let history = engram
            .metadata
            .get("feedback_history")
            .and_then(|v| v.as_array().cloned())
            .unwrap();
        assert_eq!(history.len(), HISTORY_LIMIT);
    }

    #[test]
    fn test_flush_tolerates_forgotten_engrams() {
        let (feedback, store, id) = setup();
        feedback.on_retrieved(&[id]);
        store
            .with_connection(|conn| queries::delete_engram(conn, id))
            .unwrap();

        assert_eq!(feedback.flush_retrievals().unwrap(), 0);
    }
}
