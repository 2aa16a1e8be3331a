//! Property-based tests for limbic
//!
//! These tests verify invariants that must hold for all inputs:
//! - Scores stay inside the unit interval
//! - Decay is monotone in time, access reinforcement is monotone in count
//! - Attention weights stay on the floor-respecting simplex
//! - Deduplication is idempotent
//! - Query routing is a pure function of the normalised query
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

use chrono::Utc;
use std::collections::HashMap;

use limbic::types::{Engram, EngramCategory};

fn engram(importance: f32, decay_rate: f32, access_count: i64, protected: bool) -> Engram {
    Engram {
        id: 1,
        content: "property test engram".to_string(),
        category: EngramCategory::Fact,
        importance,
        original_importance: importance,
        embedding: None,
        metadata: HashMap::new(),
        access_count,
        last_accessed_at: None,
        inserted_at: Utc::now(),
        updated_at: Utc::now(),
        decay_rate,
        protected,
        thread_id: None,
        project_id: "global".to_string(),
        tags: vec![],
        superseded_at: None,
        content_hash: None,
        has_embedding: false,
    }
}

// ============================================================================
// DECAY SCORING
// ============================================================================

mod decay_tests {
    use super::*;
    use limbic::scoring::decay;

    proptest! {
        /// Invariant: the score is always within [0, 1]
        #[test]
        fn score_bounds(
            importance in 0.0f32..=1.0,
            decay_rate in 0.0f32..=1.0,
            access_count in 0i64..1_000_000,
            active_days in 0.0f64..10_000.0,
        ) {
            let e = engram(importance, decay_rate, access_count, false);
            let score = decay::calculate_score(&e, active_days);
            prop_assert!((0.0..=1.0).contains(&score));
        }

        /// Invariant: for fixed fields, the score never grows with time
        #[test]
        fn decay_monotonic_in_active_days(
            importance in 0.0f32..=1.0,
            decay_rate in 0.0f32..=1.0,
            access_count in 0i64..10_000,
            t1 in 0.0f64..5_000.0,
            dt in 0.0f64..5_000.0,
        ) {
            let e = engram(importance, decay_rate, access_count, false);
            let earlier = decay::calculate_score(&e, t1);
            let later = decay::calculate_score(&e, t1 + dt);
            prop_assert!(later <= earlier + 1e-6);
        }

        /// Invariant: for fixed fields, the score never shrinks with access
        #[test]
        fn score_monotonic_in_access(
            importance in 0.0f32..=1.0,
            decay_rate in 0.0f32..=1.0,
            active_days in 0.0f64..1_000.0,
            count in 0i64..100_000,
            extra in 0i64..100_000,
        ) {
            let quiet = engram(importance, decay_rate, count, false);
            let busy = engram(importance, decay_rate, count + extra, false);
            let quiet_score = decay::calculate_score(&quiet, active_days);
            let busy_score = decay::calculate_score(&busy, active_days);
            prop_assert!(busy_score + 1e-6 >= quiet_score);
        }

        /// Invariant: protected engrams are never eligible for forgetting
        #[test]
        fn protected_never_forgettable(
            importance in 0.0f32..=1.0,
            decay_rate in 0.0f32..=1.0,
            active_days in 0.0f64..10_000.0,
            threshold in 0.0f32..=1.0,
        ) {
            let shielded = engram(importance, decay_rate, 0, true);
            prop_assert!(!decay::should_forget(&shielded, active_days, threshold));
        }

        /// Invariant: a finite forgetting horizon lands on the threshold
        #[test]
        fn forgetting_horizon_is_consistent(
            importance in 0.01f32..0.94,
            decay_rate in 0.001f32..=1.0,
            access_count in 0i64..1_000,
        ) {
            let e = engram(importance, decay_rate, access_count, false);
            if let decay::ForgettingHorizon::ActiveDays(days) =
                decay::predict_forgetting(&e, 0.1)
            {
                if days > 0.0 {
                    let score = decay::calculate_score(&e, days);
                    prop_assert!((score - 0.1).abs() < 1e-3,
                        "score at horizon {} was {}", days, score);
                }
            }
        }
    }
}

// ============================================================================
// ATTENTION WEIGHTS
// ============================================================================

mod attention_tests {
    use super::*;
    use limbic::attention::{AttentionLearner, FactorContributions, FeedbackSignal};

    proptest! {
        /// Invariant: after any feedback sequence the weights sum to 1
        /// and respect the 0.05 floor
        #[test]
        fn weight_invariant_under_feedback(
            events in prop::collection::vec(
                (0u8..3, 0.0f32..=1.0, 0.0f32..=1.0, 0.0f32..=1.0, 0.0f32..=1.0),
                0..200,
            )
        ) {
            let learner = AttentionLearner::new();
            for (signal, a, b, c, d) in events {
                let signal = match signal {
                    0 => FeedbackSignal::Positive,
                    1 => FeedbackSignal::Negative,
                    _ => FeedbackSignal::Neutral,
                };
                learner.record_feedback(signal, &FactorContributions {
                    edge_weight: a,
                    embedding_sim: b,
                    recency: c,
                    access: d,
                });

                let weights = learner.weights();
                prop_assert!((weights.sum() - 1.0).abs() < 1e-6);
                prop_assert!(weights.min() >= 0.05 - 1e-6);
            }
        }
    }
}

// ============================================================================
// DEDUPLICATION
// ============================================================================

mod dedup_tests {
    use super::*;
    use limbic::retrieval::dedup_by_max_score;
    use limbic::types::{RetrievalSource, ScoredEngram};

    fn scored(id: i64, score: f32) -> ScoredEngram {
        let mut e = engram(0.5, 0.005, 0, false);
        e.id = id;
        e.content = format!("content {}", id);
        ScoredEngram {
            engram: e,
            score,
            source: RetrievalSource::Vector,
        }
    }

    proptest! {
        /// Invariant: deduplication is idempotent
        #[test]
        fn dedup_idempotent(
            items in prop::collection::vec((1i64..50, 0.0f32..=1.0), 0..100)
        ) {
            let input: Vec<ScoredEngram> =
                items.into_iter().map(|(id, s)| scored(id, s)).collect();

            let once = dedup_by_max_score(input);
            let twice = dedup_by_max_score(once.clone());

            prop_assert_eq!(once.len(), twice.len());
            for (a, b) in once.iter().zip(twice.iter()) {
                prop_assert_eq!(a.engram.id, b.engram.id);
                prop_assert_eq!(a.score, b.score);
            }
        }

        /// Invariant: every surviving entry carries the maximum score
        /// observed for its id
        #[test]
        fn dedup_keeps_max(
            items in prop::collection::vec((1i64..20, 0.0f32..=1.0), 1..100)
        ) {
            let mut expected: std::collections::HashMap<i64, f32> = Default::default();
            for (id, score) in &items {
                let best = expected.entry(*id).or_insert(f32::MIN);
                if score > best {
                    *best = *score;
                }
            }

            let input: Vec<ScoredEngram> =
                items.into_iter().map(|(id, s)| scored(id, s)).collect();
            let deduped = dedup_by_max_score(input);

            prop_assert_eq!(deduped.len(), expected.len());
            for result in deduped {
                prop_assert_eq!(result.score, expected[&result.engram.id]);
            }
        }
    }
}

// ============================================================================
// QUERY ROUTING
// ============================================================================

mod router_tests {
    use super::*;
    use limbic::retrieval::router::{normalize_query, QueryRouter};

    proptest! {
        /// Invariant: analysis never panics on arbitrary input
        #[test]
        fn analyze_never_panics(query in ".*") {
            let router = QueryRouter::new();
            let _ = router.analyze(&query);
            let _ = router.recommend_operation(&query);
        }

        /// Invariant: analysis is a pure function of the lowercased,
        /// punctuation-stripped query
        #[test]
        fn analyze_pure_over_normal_form(query in "\\PC{0,80}") {
            let router = QueryRouter::new();
            let direct = router.analyze(&query);
            let normalised = router.analyze(&normalize_query(&query));
            prop_assert_eq!(direct, normalised);
        }

        /// Invariant: ASCII case changes never affect classification
        #[test]
        fn analyze_ascii_case_insensitive(query in "[a-zA-Z ?!,]{0,80}") {
            let router = QueryRouter::new();
            prop_assert_eq!(
                router.analyze(&query),
                router.analyze(&query.to_uppercase())
            );
        }

        /// Invariant: confidence stays in [0, 1]
        #[test]
        fn confidence_in_unit_interval(query in "\\PC{0,80}") {
            let router = QueryRouter::new();
            let analysis = router.analyze(&query);
            prop_assert!((0.0..=1.0).contains(&analysis.confidence));
        }
    }
}

// ============================================================================
// EMBEDDING FORMS
// ============================================================================

mod embedding_tests {
    use super::*;
    use limbic::embedding::cosine_similarity;
    use limbic::types::QuantizedEmbedding;

    proptest! {
        /// Invariant: int8 quantisation reconstructs cosine similarity
        /// within 1e-3 of the float form
        #[test]
        fn quantised_cosine_close(
            values in prop::collection::vec(-10.0f32..10.0, 8..256)
        ) {
            prop_assume!(values.iter().any(|v| v.abs() > 0.01));
            let q = QuantizedEmbedding::from_floats(&values);
            let restored = q.to_floats();
            let cosine = cosine_similarity(&values, &restored);
            prop_assert!((cosine - 1.0).abs() < 1e-3, "cosine was {}", cosine);
        }

        /// Invariant: cosine of mismatched lengths is exactly 0
        #[test]
        fn mismatched_lengths_zero(
            a in prop::collection::vec(-1.0f32..1.0, 1..16),
            b in prop::collection::vec(-1.0f32..1.0, 17..32),
        ) {
            prop_assert_eq!(cosine_similarity(&a, &b), 0.0);
        }
    }
}

// ============================================================================
// CONTENT HASHING
// ============================================================================

mod hash_tests {
    use super::*;
    use limbic::storage::queries::content_hash;

    proptest! {
        /// Invariant: hashing ignores leading/trailing whitespace
        #[test]
        fn hash_trim_equivalence(core in "[a-z ]{1,40}") {
            let padded = format!("  {}\t\n", core);
            prop_assert_eq!(content_hash(&padded), content_hash(core.trim()));
        }

        /// Invariant: hashes are stable hex of fixed width
        #[test]
        fn hash_shape(content in "\\PC{0,100}") {
            let hash = content_hash(&content);
            prop_assert_eq!(hash.len(), 64);
            prop_assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
