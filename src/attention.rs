//! Attention learner
//!
//! Online adjustment of retrieval scoring weights from user feedback.
//! The weight vector spans {edge_weight, embedding_sim, recency, access},
//! always sums to 1, and every weight stays at or above the floor.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Learning rate per feedback event
const LEARNING_RATE: f32 = 0.01;

/// Weight floor
const MIN_WEIGHT: f32 = 0.05;

/// Retained weight-vector snapshots for diagnostics
const HISTORY_LIMIT: usize = 100;

/// Feedback polarity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackSignal {
    Positive,
    Negative,
    Neutral,
}

/// Weight vector over the attention factors
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttentionWeights {
    pub edge_weight: f32,
    pub embedding_sim: f32,
    pub recency: f32,
    pub access: f32,
}

impl Default for AttentionWeights {
    fn default() -> Self {
        Self {
            edge_weight: 0.25,
            embedding_sim: 0.25,
            recency: 0.25,
            access: 0.25,
        }
    }
}

impl AttentionWeights {
    fn as_array(&self) -> [f32; 4] {
        [self.edge_weight, self.embedding_sim, self.recency, self.access]
    }

    fn from_array(values: [f32; 4]) -> Self {
        Self {
            edge_weight: values[0],
            embedding_sim: values[1],
            recency: values[2],
            access: values[3],
        }
    }

    pub fn sum(&self) -> f32 {
        self.as_array().iter().sum()
    }

    pub fn min(&self) -> f32 {
        self.as_array().iter().cloned().fold(f32::INFINITY, f32::min)
    }
}

/// Per-factor contribution values recorded when the engram was scored
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FactorContributions {
    pub edge_weight: f32,
    pub embedding_sim: f32,
    pub recency: f32,
    pub access: f32,
}

impl FactorContributions {
    fn as_array(&self) -> [f32; 4] {
        [self.edge_weight, self.embedding_sim, self.recency, self.access]
    }
}

struct LearnerState {
    weights: AttentionWeights,
    history: VecDeque<AttentionWeights>,
}

/// Online learner over the attention weight vector
pub struct AttentionLearner {
    state: Mutex<LearnerState>,
}

impl Default for AttentionLearner {
    fn default() -> Self {
        Self::new()
    }
}

impl AttentionLearner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LearnerState {
                weights: AttentionWeights::default(),
                history: VecDeque::new(),
            }),
        }
    }

    /// Current weight vector
    pub fn weights(&self) -> AttentionWeights {
        self.state.lock().weights
    }

    /// Recent weight snapshots, newest last
    pub fn history(&self) -> Vec<AttentionWeights> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Apply one feedback event
    ///
    /// Neutral is a no-op. Otherwise each factor moves proportionally to
    /// its normalised contribution to the scored result, then the vector
    /// is projected back onto the floor-respecting simplex.
    pub fn record_feedback(&self, signal: FeedbackSignal, contributions: &FactorContributions) {
        let direction = match signal {
            FeedbackSignal::Neutral => return,
            FeedbackSignal::Positive => 1.0f32,
            FeedbackSignal::Negative => -1.0f32,
        };

        let mut state = self.state.lock();
        let weights = state.weights.as_array();
        let context = contributions.as_array();

        let weighted: [f32; 4] = [
            weights[0] * context[0],
            weights[1] * context[1],
            weights[2] * context[2],
            weights[3] * context[3],
        ];
        let denominator: f32 = weighted.iter().sum();

        let normalised: [f32; 4] = if denominator.abs() < f32::EPSILON {
            [0.25; 4]
        } else {
            [
                weighted[0] / denominator,
                weighted[1] / denominator,
                weighted[2] / denominator,
                weighted[3] / denominator,
            ]
        };

        let mut updated = [0.0f32; 4];
        for i in 0..4 {
            let delta = LEARNING_RATE * normalised[i] * direction;
            updated[i] = if direction > 0.0 {
                weights[i] + delta * (1.0 - weights[i])
            } else {
                weights[i] + delta * weights[i]
            };
            updated[i] = updated[i].clamp(MIN_WEIGHT, 1.0);
        }

        state.weights = AttentionWeights::from_array(project_to_simplex(updated));

        let snapshot = state.weights;
        state.history.push_back(snapshot);
        while state.history.len() > HISTORY_LIMIT {
            state.history.pop_front();
        }
    }
}

/// Project onto {w : sum w = 1, w_i >= MIN_WEIGHT}
///
/// Distributes the mass above the floor proportionally, so both the sum
/// and the floor hold exactly after every update.
fn project_to_simplex(weights: [f32; 4]) -> [f32; 4] {
    let n = weights.len() as f32;
    let target_excess = 1.0 - MIN_WEIGHT * n;

    let excess: Vec<f32> = weights.iter().map(|w| (w - MIN_WEIGHT).max(0.0)).collect();
    let total_excess: f32 = excess.iter().sum();

    if total_excess <= f32::EPSILON {
        return [1.0 / n; 4];
    }

    let mut projected = [0.0f32; 4];
    for i in 0..4 {
        projected[i] = MIN_WEIGHT + excess[i] * target_excess / total_excess;
    }
    projected
}
