//! Forgetting sweeper
//!
//! Periodically deletes engrams whose decayed score fell below the
//! threshold. Protected engrams are exempt unconditionally. Dry-run mode
//! reports candidates without deleting.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::activity::ActivityTracker;
use crate::error::Result;
use crate::scoring::decay;
use crate::storage::{queries, EngramStore};
use crate::telemetry::{events, TelemetrySink};
use crate::types::{Engram, EngramId, ForgettingConfig};
use crate::writer::WriteSerializer;

/// Outcome of one sweep
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForgettingReport {
    pub examined: usize,
    pub candidates: usize,
    pub deleted: usize,
    pub dry_run: bool,
}

/// Deletes decayed engrams in bounded batches
pub struct ForgettingSweeper {
    store: EngramStore,
    writer: Arc<WriteSerializer>,
    activity: Arc<ActivityTracker>,
    telemetry: Arc<dyn TelemetrySink>,
    config: ForgettingConfig,
}

impl ForgettingSweeper {
    pub fn new(
        store: EngramStore,
        writer: Arc<WriteSerializer>,
        activity: Arc<ActivityTracker>,
        telemetry: Arc<dyn TelemetrySink>,
        config: ForgettingConfig,
    ) -> Self {
        Self {
            store,
            writer,
            activity,
            telemetry,
            config,
        }
    }

    fn active_days_for(&self, engram: &Engram) -> f64 {
        let reference = engram.last_accessed_at.unwrap_or(engram.inserted_at);
        let tracked = self.activity.active_days_since(reference);
        if self.activity.total_active_days() > 0 {
            tracked
        } else {
            // No tracker state: calendar-day fallback
            decay::calendar_days_since_access(engram, chrono::Utc::now())
        }
    }

    /// Unprotected engrams whose score sits below the threshold
    pub fn collect_to_delete(&self) -> Result<Vec<Engram>> {
        let batch = self
            .store
            .with_connection(|conn| queries::unprotected_batch(conn, self.config.batch_size))?;

        Ok(batch
            .into_iter()
            .filter(|engram| {
                decay::should_forget(engram, self.active_days_for(engram), self.config.threshold)
            })
            .collect())
    }

    /// One sweep; `dry_run` from config unless overridden
    pub async fn run_once(&self, dry_run_override: Option<bool>) -> Result<ForgettingReport> {
        if !self.config.enabled {
            return Ok(ForgettingReport::default());
        }

        let dry_run = dry_run_override.unwrap_or(self.config.dry_run);

        self.telemetry.emit(
            events::FORGETTING_STARTED,
            &HashMap::new(),
            &serde_json::json!({ "dry_run": dry_run }),
        );

        let batch = self
            .store
            .with_connection(|conn| queries::unprotected_batch(conn, self.config.batch_size))?;
        let examined = batch.len();
        let to_forget: Vec<Engram> = batch
            .into_iter()
            .filter(|engram| {
                decay::should_forget(engram, self.active_days_for(engram), self.config.threshold)
            })
            .collect();
        let candidates = to_forget.len();

        let deleted = if dry_run {
            for engram in &to_forget {
                tracing::info!(
                    id = engram.id,
                    importance = engram.importance,
                    "dry run: would forget engram"
                );
            }
            0
        } else {
            let ids: Vec<EngramId> = to_forget.iter().map(|e| e.id).collect();
            let deleted = if ids.is_empty() {
                0
            } else {
                self.writer.delete_all(ids.clone()).await?
            };
            for id in &ids {
                self.telemetry.emit(
                    events::DECAYED,
                    &HashMap::new(),
                    &serde_json::json!({ "id": id }),
                );
            }
            deleted
        };

        let mut measurements = HashMap::new();
        measurements.insert("examined".to_string(), examined as f64);
        measurements.insert("candidates".to_string(), candidates as f64);
        measurements.insert("deleted".to_string(), deleted as f64);
        self.telemetry.emit(
            events::FORGETTING_COMPLETED,
            &measurements,
            &serde_json::json!({ "dry_run": dry_run }),
        );

        Ok(ForgettingReport {
            examined,
            candidates,
            deleted,
            dry_run,
        })
    }

    /// Run sweeps on the configured interval
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_millis(self.config.interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once(None).await {
                    tracing::warn!("forgetting sweep failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;
    use crate::types::{CreateEngramInput, EngramCategory};
    use chrono::Utc;
    use rusqlite::params;

    struct Fixture {
        sweeper: ForgettingSweeper,
        store: EngramStore,
        sink: Arc<MemorySink>,
    }

    fn fixture(config: ForgettingConfig) -> Fixture {
        let store = EngramStore::open_in_memory().unwrap();
        let sink = Arc::new(MemorySink::new());
        let writer = WriteSerializer::start(store.clone());
        let sweeper = ForgettingSweeper::new(
            store.clone(),
            writer,
            Arc::new(ActivityTracker::new(24)),
            sink.clone(),
            config,
        );
        Fixture {
            sweeper,
            store,
            sink,
        }
    }

    /// Seed a faded engram: importance 0.2, 40 days since last access
    fn seed_faded(store: &EngramStore, protected: bool) -> EngramId {
        store
            .with_connection(|conn| {
                let engram = queries::create_engram(
                    conn,
                    &CreateEngramInput {
                        content: "long forgotten scratch note".to_string(),
                        category: EngramCategory::Observation,
                        importance: Some(0.2),
                        protected,
                        ..Default::default()
                    },
                )?;
                let stale = queries::format_ts(Utc::now() - chrono::Duration::days(40));
                conn.execute(
                    "UPDATE engrams SET last_accessed_at = ? WHERE id = ?",
                    params![stale, engram.id],
                )?;
                Ok(engram.id)
            })
            .unwrap()
    }

    fn seed_fresh(store: &EngramStore) -> EngramId {
        store
            .with_connection(|conn| {
                Ok(queries::create_engram(
                    conn,
                    &CreateEngramInput {
                        content: "important durable fact".to_string(),
                        category: EngramCategory::Fact,
                        importance: Some(0.9),
                        ..Default::default()
                    },
                )?
                .id)
            })
            .unwrap()
    }

    fn count(store: &EngramStore) -> i64 {
        store
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM engrams", [], |r| r.get(0))?)
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_dry_run_reports_without_deleting() {
        let fixture = fixture(ForgettingConfig::default());
        seed_faded(&fixture.store, false);
        seed_fresh(&fixture.store);

        let report = fixture.sweeper.run_once(Some(true)).await.unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(report.deleted, 0);
        assert!(report.dry_run);
        assert_eq!(count(&fixture.store), 2);
        assert_eq!(fixture.sink.count(events::DECAYED), 0);
    }

    #[tokio::test]
    async fn test_wet_run_deletes_candidates() {
        let fixture = fixture(ForgettingConfig::default());
        let faded = seed_faded(&fixture.store, false);
        let fresh = seed_fresh(&fixture.store);

        let report = fixture.sweeper.run_once(Some(false)).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(count(&fixture.store), 1);
        assert_eq!(fixture.sink.count(events::DECAYED), 1);

        // The fresh engram survives, the faded one is gone
        let survivors: Vec<EngramId> = fixture
            .store
            .with_connection(|conn| {
                let mut stmt = conn.prepare("SELECT id FROM engrams")?;
                let ids = stmt
                    .query_map([], |r| r.get(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(ids)
            })
            .unwrap();
        assert!(survivors.contains(&fresh));
        assert!(!survivors.contains(&faded));
    }

    #[tokio::test]
    async fn test_protected_survives_both_modes() {
        let fixture = fixture(ForgettingConfig::default());
        seed_faded(&fixture.store, true);

        let report = fixture.sweeper.run_once(Some(true)).await.unwrap();
        assert_eq!(report.candidates, 0);

        let report = fixture.sweeper.run_once(Some(false)).await.unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(count(&fixture.store), 1);
    }

    #[tokio::test]
    async fn test_collect_never_returns_protected() {
        let fixture = fixture(ForgettingConfig::default());
        seed_faded(&fixture.store, true);
        seed_faded(&fixture.store, false);

        let candidates = fixture.sweeper.collect_to_delete().unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(!candidates[0].protected);
    }

    #[tokio::test]
    async fn test_disabled_sweeper_is_inert() {
        let fixture = fixture(ForgettingConfig {
            enabled: false,
            ..Default::default()
        });
        seed_faded(&fixture.store, false);

        let report = fixture.sweeper.run_once(Some(false)).await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(count(&fixture.store), 1);
    }

    #[tokio::test]
    async fn test_batch_size_bounds_examination() {
        let fixture = fixture(ForgettingConfig {
            batch_size: 1,
            ..Default::default()
        });
        seed_faded(&fixture.store, false);
        seed_faded(&fixture.store, false);

        let report = fixture.sweeper.run_once(Some(true)).await.unwrap();
        assert_eq!(report.examined, 1);
    }
}
