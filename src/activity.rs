//! Activity tracker
//!
//! Records the set of UTC calendar dates on which any user-facing
//! operation registered activity. The decay scorer measures time in
//! these active days rather than wall-clock days, so idle weeks do not
//! erode memory.

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::Result;
use crate::storage::{queries, EngramStore};

struct ActivityState {
    active_dates: BTreeSet<NaiveDate>,
    last_activity: Option<DateTime<Utc>>,
}

/// Tracks active days and the most recent activity timestamp
pub struct ActivityTracker {
    state: Mutex<ActivityState>,
    inactivity_threshold: Duration,
}

impl ActivityTracker {
    pub fn new(inactivity_threshold_hours: u64) -> Self {
        Self {
            state: Mutex::new(ActivityState {
                active_dates: BTreeSet::new(),
                last_activity: None,
            }),
            inactivity_threshold: Duration::from_secs(inactivity_threshold_hours * 3600),
        }
    }

    /// Rebuild state from the distinct access dates recorded in the store
    pub fn rebuild_from_store(&self, store: &EngramStore) -> Result<()> {
        let dates = store.with_connection(queries::distinct_access_dates)?;
        let mut state = self.state.lock();
        for date in dates {
            state.active_dates.insert(date);
        }
        Ok(())
    }

    /// Record activity now
    pub fn register_activity(&self) {
        self.register_activity_at(Utc::now());
    }

    /// Record activity at an explicit instant (test hook)
    pub fn register_activity_at(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.active_dates.insert(now.date_naive());
        state.last_activity = Some(now);
    }

    /// Count of active days between `since` and now
    ///
    /// Recorded active dates in `[date(since), today]` minus 1, plus the
    /// fraction of today elapsed iff today is active. Never negative.
    pub fn active_days_since(&self, since: DateTime<Utc>) -> f64 {
        self.active_days_between(since, Utc::now())
    }

    /// As `active_days_since`, with an explicit clock (test hook)
    pub fn active_days_between(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let state = self.state.lock();
        let from = since.date_naive();
        let today = now.date_naive();

        let count = state
            .active_dates
            .range(from..=today)
            .count() as f64;

        let fraction = if state.active_dates.contains(&today) {
            now.num_seconds_from_midnight() as f64 / 86_400.0
        } else {
            0.0
        };

        (count - 1.0 + fraction).max(0.0)
    }

    /// True iff activity was registered within the inactivity threshold
    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }

    fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock();
        match state.last_activity {
            Some(last) => {
                let elapsed = (now - last).to_std().unwrap_or_default();
                elapsed < self.inactivity_threshold
            }
            None => false,
        }
    }

    /// Timestamp of the most recent activity
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_activity
    }

    /// Number of recorded active days
    pub fn total_active_days(&self) -> usize {
        self.state.lock().active_dates.len()
    }
}
