//! Relevance scoring: active-day decay and hybrid ranking

pub mod decay;
pub mod hybrid;

pub use decay::{
    calculate_score, decay_rate_for_importance, predict_forgetting, should_forget,
    ForgettingHorizon, DEFAULT_FORGET_THRESHOLD,
};
pub use hybrid::{access_factor, explain, score, ScoreExplanation, ScoreInputs, StrategyWeights};
