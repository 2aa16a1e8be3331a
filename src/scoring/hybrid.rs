//! Hybrid scoring: weighted combination of vector similarity, decayed
//! recency, access frequency, importance, and graph connectivity

use serde::{Deserialize, Serialize};

use super::decay;
use crate::embedding::cosine_similarity;
use crate::types::{Engram, RetrievalStrategy};

/// Weight vector over the hybrid-score components
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyWeights {
    pub vector: f32,
    pub recency: f32,
    pub access: f32,
    pub importance: f32,
    pub graph: f32,
}

impl StrategyWeights {
    pub fn for_strategy(strategy: RetrievalStrategy) -> Self {
        match strategy {
            RetrievalStrategy::Balanced => Self {
                vector: 0.35,
                recency: 0.25,
                access: 0.15,
                importance: 0.15,
                graph: 0.10,
            },
            RetrievalStrategy::VectorHeavy => Self {
                vector: 0.50,
                recency: 0.15,
                access: 0.10,
                importance: 0.15,
                graph: 0.10,
            },
            RetrievalStrategy::GraphHeavy => Self {
                vector: 0.25,
                recency: 0.15,
                access: 0.15,
                importance: 0.15,
                graph: 0.30,
            },
            RetrievalStrategy::RecencyHeavy => Self {
                vector: 0.25,
                recency: 0.40,
                access: 0.10,
                importance: 0.15,
                graph: 0.10,
            },
        }
    }
}

/// Inputs for one scoring pass
#[derive(Debug, Clone, Default)]
pub struct ScoreInputs<'a> {
    pub query_embedding: Option<&'a [f32]>,
    /// Pre-computed similarity; takes precedence over `query_embedding`
    pub vector_similarity: Option<f32>,
    /// Pre-computed graph connectivity score in [0, 1]
    pub graph_score: Option<f32>,
    /// Active days for the recency component
    pub active_days: f64,
}

/// Log-scaled access factor: `min(1, ln(1 + count) / ln(11))`
pub fn access_factor(access_count: i64) -> f32 {
    let factor = ((1.0 + access_count.max(0) as f64).ln() / 11f64.ln()) as f32;
    factor.min(1.0)
}

fn vector_component(engram: &Engram, inputs: &ScoreInputs) -> f32 {
    if let Some(similarity) = inputs.vector_similarity {
        return similarity;
    }
    match (inputs.query_embedding, engram.embedding.as_deref()) {
        // Mismatched lengths score 0 inside cosine_similarity
        (Some(query), Some(embedding)) => cosine_similarity(query, embedding),
        _ => 0.0,
    }
}

/// Compute the hybrid score, clamped to [0, 1]
pub fn score(engram: &Engram, inputs: &ScoreInputs, weights: &StrategyWeights) -> f32 {
    let vector = vector_component(engram, inputs);
    let recency = decay::calculate_score(engram, inputs.active_days);
    let access = access_factor(engram.access_count);
    let importance = engram.importance;
    let graph = inputs.graph_score.unwrap_or(0.0);

    let total = weights.vector * vector
        + weights.recency * recency
        + weights.access * access
        + weights.importance * importance
        + weights.graph * graph;

    total.clamp(0.0, 1.0)
}

/// One component of an explained score
#[derive(Debug, Clone, Serialize)]
pub struct ScoreComponent {
    pub name: &'static str,
    pub raw: f32,
    pub weight: f32,
    pub product: f32,
}

/// Per-component score breakdown
#[derive(Debug, Clone, Serialize)]
pub struct ScoreExplanation {
    pub components: Vec<ScoreComponent>,
    pub total: f32,
}

/// Explain a scoring pass: raw value, weight, and product per component,
/// plus the clamped total
pub fn explain(engram: &Engram, inputs: &ScoreInputs, weights: &StrategyWeights) -> ScoreExplanation {
    let raw = [
        ("vector", vector_component(engram, inputs), weights.vector),
        (
            "recency",
            decay::calculate_score(engram, inputs.active_days),
            weights.recency,
        ),
        ("access", access_factor(engram.access_count), weights.access),
        ("importance", engram.importance, weights.importance),
        ("graph", inputs.graph_score.unwrap_or(0.0), weights.graph),
    ];

    let components: Vec<ScoreComponent> = raw
        .iter()
        .map(|&(name, raw, weight)| ScoreComponent {
            name,
            raw,
            weight,
            product: raw * weight,
        })
        .collect();

    let total = components
        .iter()
        .map(|c| c.product)
        .sum::<f32>()
        .clamp(0.0, 1.0);

    ScoreExplanation { components, total }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EngramCategory;
    use chrono::Utc;
    use std::collections::HashMap;

    fn engram(importance: f32, access_count: i64, embedding: Option<Vec<f32>>) -> Engram {
        Engram {
            id: 1,
            content: "test".to_string(),
            category: EngramCategory::Fact,
            importance,
            original_importance: importance,
            embedding,
            metadata: HashMap::new(),
            access_count,
            last_accessed_at: None,
            inserted_at: Utc::now(),
            updated_at: Utc::now(),
            decay_rate: 0.005,
            protected: false,
            thread_id: None,
            project_id: "global".to_string(),
            tags: vec![],
            superseded_at: None,
            content_hash: None,
            has_embedding: false,
        }
    }

    #[test]
    fn test_access_factor_saturates() {
        assert_eq!(access_factor(0), 0.0);
        assert!((access_factor(10) - 1.0).abs() < 1e-6);
        assert_eq!(access_factor(1000), 1.0);
    }

    #[test]
    fn test_strategy_weights_sum_to_one() {
        for strategy in [
            RetrievalStrategy::Balanced,
            RetrievalStrategy::VectorHeavy,
            RetrievalStrategy::GraphHeavy,
            RetrievalStrategy::RecencyHeavy,
        ] {
            let w = StrategyWeights::for_strategy(strategy);
            let sum = w.vector + w.recency + w.access + w.importance + w.graph;
            assert!((sum - 1.0).abs() < 1e-6, "{:?} sums to {}", strategy, sum);
        }
    }

    #[test]
    fn test_score_in_unit_interval() {
        let e = engram(1.0, 100, Some(vec![1.0, 0.0]));
        let inputs = ScoreInputs {
            query_embedding: Some(&[1.0, 0.0]),
            graph_score: Some(1.0),
            ..Default::default()
        };
        let weights = StrategyWeights::for_strategy(RetrievalStrategy::Balanced);
        let s = score(&e, &inputs, &weights);
        assert!((0.0..=1.0).contains(&s));
    }

    #[test]
    fn test_mismatched_vector_lengths_score_zero() {
        let e = engram(0.0, 0, Some(vec![1.0, 0.0, 0.0]));
        let inputs = ScoreInputs {
            query_embedding: Some(&[1.0, 0.0]),
            ..Default::default()
        };
        let weights = StrategyWeights {
            vector: 1.0,
            recency: 0.0,
            access: 0.0,
            importance: 0.0,
            graph: 0.0,
        };
        assert_eq!(score(&e, &inputs, &weights), 0.0);
    }

    #[test]
    fn test_precomputed_similarity_takes_precedence() {
        let e = engram(0.0, 0, Some(vec![1.0, 0.0]));
        let inputs = ScoreInputs {
            query_embedding: Some(&[0.0, 1.0]),
            vector_similarity: Some(0.9),
            ..Default::default()
        };
        let weights = StrategyWeights {
            vector: 1.0,
            recency: 0.0,
            access: 0.0,
            importance: 0.0,
            graph: 0.0,
        };
        assert!((score(&e, &inputs, &weights) - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_explain_products_match_total() {
        let e = engram(0.7, 5, None);
        let inputs = ScoreInputs {
            graph_score: Some(0.4),
            active_days: 2.0,
            ..Default::default()
        };
        let weights = StrategyWeights::for_strategy(RetrievalStrategy::GraphHeavy);

        let explanation = explain(&e, &inputs, &weights);
        assert_eq!(explanation.components.len(), 5);
        let sum: f32 = explanation.components.iter().map(|c| c.product).sum();
        assert!((explanation.total - sum.clamp(0.0, 1.0)).abs() < 1e-6);
        assert!((explanation.total - score(&e, &inputs, &weights)).abs() < 1e-6);
    }
}
