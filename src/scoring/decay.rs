//! Time-decayed relevance scoring
//!
//! Pure functions over an engram's decay-relevant fields. The time axis
//! is active-usage days supplied by the activity tracker, not wall-clock
//! days; callers without a tracker fall back to calendar days.

use chrono::{DateTime, Utc};

use crate::types::Engram;

/// Default forgetting threshold
pub const DEFAULT_FORGET_THRESHOLD: f32 = 0.1;

/// Derive the default decay rate from importance
///
/// Half-lives: >=0.9 ~693d, 0.7-0.9 ~69d, 0.5-0.7 ~14d, 0.3-0.5 ~3.5d,
/// <0.3 ~17h.
pub fn decay_rate_for_importance(importance: f32) -> f32 {
    if importance >= 0.9 {
        0.0001
    } else if importance >= 0.7 {
        0.001
    } else if importance >= 0.5 {
        0.005
    } else if importance >= 0.3 {
        0.02
    } else {
        0.1
    }
}

/// Effective score after decay and access reinforcement
///
/// `clamp(importance * exp(-decay_rate * active_days)
///        * (1 + 0.1 * ln(1 + access_count)), 0, 1)`
pub fn calculate_score(engram: &Engram, active_days: f64) -> f32 {
    let active_days = active_days.max(0.0);
    let decayed = engram.importance as f64 * (-(engram.decay_rate as f64) * active_days).exp();
    let reinforced = decayed * (1.0 + 0.1 * (1.0 + engram.access_count.max(0) as f64).ln());
    reinforced.clamp(0.0, 1.0) as f32
}

/// Calendar-day fallback when no activity tracker is available
///
/// Measured from `last_accessed_at`, or `inserted_at` if never accessed.
pub fn calendar_days_since_access(engram: &Engram, now: DateTime<Utc>) -> f64 {
    let reference = engram.last_accessed_at.unwrap_or(engram.inserted_at);
    let elapsed = (now - reference).num_milliseconds() as f64 / 86_400_000.0;
    elapsed.max(0.0)
}

/// True iff the engram is eligible for forgetting at this threshold
pub fn should_forget(engram: &Engram, active_days: f64, threshold: f32) -> bool {
    !engram.protected && calculate_score(engram, active_days) < threshold
}

/// When an engram will cross the forgetting threshold, on the
/// active-days axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ForgettingHorizon {
    Never,
    /// Active days from now until the score drops below the threshold
    ActiveDays(f64),
}

/// Closed-form solve of the decay formula for the active-days axis
pub fn predict_forgetting(engram: &Engram, threshold: f32) -> ForgettingHorizon {
    if engram.protected || engram.importance >= 0.95 || engram.decay_rate == 0.0 {
        return ForgettingHorizon::Never;
    }
    if engram.importance <= 0.0 {
        return ForgettingHorizon::ActiveDays(0.0);
    }

    // threshold = importance * exp(-rate * d) * access_factor
    let access_factor = 1.0 + 0.1 * (1.0 + engram.access_count.max(0) as f64).ln();
    let ratio = engram.importance as f64 * access_factor / threshold as f64;
    if ratio <= 1.0 {
        return ForgettingHorizon::ActiveDays(0.0);
    }
    ForgettingHorizon::ActiveDays(ratio.ln() / engram.decay_rate as f64)
}
