//! Query router
//!
//! Classifies query intent from keywords and patterns, and recommends
//! the retrieval operation. Strong temporal queries are redirected to a
//! list-by-recency operation instead of a semantic search. An optional
//! LLM analysis path can replace keyword classification and must fall
//! back to it on any parsing or transport error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::llm::LlmScheduler;
use crate::types::RetrievalStrategy;

/// Query intent classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryIntent {
    Factual,
    Relational,
    Temporal,
    Procedural,
    Aggregation,
    Hybrid,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::Factual => "factual",
            QueryIntent::Relational => "relational",
            QueryIntent::Temporal => "temporal",
            QueryIntent::Procedural => "procedural",
            QueryIntent::Aggregation => "aggregation",
            QueryIntent::Hybrid => "hybrid",
        }
    }
}

/// Classification result
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntentAnalysis {
    pub intent: QueryIntent,
    pub confidence: f32,
}

/// Why an operation was recommended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingReason {
    TemporalRedirect,
    Temporal,
    Semantic,
}

/// Which operation to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendedOp {
    List,
    Search,
}

/// Operation recommendation with extra options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub operation: RecommendedOp,
    /// Sort newest-first (list operation)
    pub sort_recent: bool,
    /// Result limit override
    pub limit: Option<usize>,
    /// Strategy override; None means auto
    pub strategy: Option<RetrievalStrategy>,
    pub reason: RoutingReason,
}

static PROCEDURAL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bhow (to|do|can|should)\b").expect("valid regex"));
static FACTUAL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bwhat (is|are|does)\b|s the\b").expect("valid regex"));
static STRONG_TEMPORAL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(latest|newest|most recent|just added|last created)\b").expect("valid regex")
});

const RELATIONAL_KEYWORDS: &[&str] = &[
    "related",
    "connected",
    "linked",
    "relationship",
    "association",
    "between",
    "depends",
];
const TEMPORAL_KEYWORDS: &[&str] = &[
    "when",
    "recent",
    "recently",
    "yesterday",
    "today",
    "latest",
    "newest",
    "last",
    "ago",
    "before",
    "after",
];
const PROCEDURAL_KEYWORDS: &[&str] = &[
    "how",
    "steps",
    "procedure",
    "process",
    "method",
    "configure",
    "install",
];
const FACTUAL_KEYWORDS: &[&str] = &[
    "what",
    "who",
    "where",
    "which",
    "define",
    "definition",
    "meaning",
];
const AGGREGATION_KEYWORDS: &[&str] = &[
    "count",
    "many",
    "total",
    "all",
    "every",
    "summarize",
    "average",
];

/// Lowercase and strip punctuation; classification is a pure function of
/// this form
pub fn normalize_query(query: &str) -> String {
    query
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn score_for_matches(count: usize) -> f32 {
    match count {
        0 => 0.0,
        1 => 0.4,
        2 => 0.6,
        _ => 0.8,
    }
}

/// LLM analysis envelope
#[derive(Debug, Clone, Deserialize)]
pub struct LlmQueryAnalysis {
    pub intent: String,
    #[serde(default)]
    pub time_reference: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub expanded_queries: Vec<String>,
    pub confidence: f32,
}

/// Full routing output
#[derive(Debug, Clone)]
pub struct RoutedQuery {
    pub analysis: IntentAnalysis,
    /// Additional retrieval seeds (max 3); merged scores are discounted
    pub expanded_queries: Vec<String>,
}

/// Keyword/pattern query router
#[derive(Default)]
pub struct QueryRouter;

impl QueryRouter {
    pub fn new() -> Self {
        Self
    }

    /// Classify intent; deterministic over the normalised query
    pub fn analyze(&self, query: &str) -> IntentAnalysis {
        let normalized = normalize_query(query);

        // Each word counts for at most one intent, first match wins in
        // this order
        let mut counts = [0usize; 5]; // relational, temporal, procedural, factual, aggregation
        for word in normalized.split_whitespace() {
            if RELATIONAL_KEYWORDS.contains(&word) {
                counts[0] += 1;
            } else if TEMPORAL_KEYWORDS.contains(&word) {
                counts[1] += 1;
            } else if PROCEDURAL_KEYWORDS.contains(&word) {
                counts[2] += 1;
            } else if FACTUAL_KEYWORDS.contains(&word) {
                counts[3] += 1;
            } else if AGGREGATION_KEYWORDS.contains(&word) {
                counts[4] += 1;
            }
        }

        // Pattern signals count as one extra match
        if PROCEDURAL_PATTERN.is_match(&normalized) {
            counts[2] += 1;
        }
        if FACTUAL_PATTERN.is_match(&normalized) {
            counts[3] += 1;
        }

        let intents = [
            QueryIntent::Relational,
            QueryIntent::Temporal,
            QueryIntent::Procedural,
            QueryIntent::Factual,
            QueryIntent::Aggregation,
        ];
        let scores: Vec<f32> = counts.iter().map(|&c| score_for_matches(c)).collect();

        // First index wins ties, keeping classification deterministic
        let mut best_index = 0;
        for (i, &s) in scores.iter().enumerate() {
            if s > scores[best_index] {
                best_index = i;
            }
        }
        let best = scores[best_index];
        let second = scores
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != best_index)
            .map(|(_, &s)| s)
            .fold(0.0f32, f32::max);

        if best < 0.1 {
            return IntentAnalysis {
                intent: QueryIntent::Hybrid,
                confidence: 0.5,
            };
        }
        if best >= 0.3 {
            return IntentAnalysis {
                intent: intents[best_index],
                confidence: best,
            };
        }
        if second > 0.8 * best {
            return IntentAnalysis {
                intent: QueryIntent::Hybrid,
                confidence: 0.6,
            };
        }
        IntentAnalysis {
            intent: intents[best_index],
            confidence: best,
        }
    }

    /// True iff the query carries a strong temporal token
    pub fn has_strong_temporal(&self, query: &str) -> bool {
        STRONG_TEMPORAL_PATTERN.is_match(&normalize_query(query))
    }

    /// Recommend the operation for a query
    pub fn recommend_operation(&self, query: &str) -> Recommendation {
        if self.has_strong_temporal(query) {
            return Recommendation {
                operation: RecommendedOp::List,
                sort_recent: true,
                limit: Some(5),
                strategy: None,
                reason: RoutingReason::TemporalRedirect,
            };
        }

        let analysis = self.analyze(query);
        if analysis.intent == QueryIntent::Temporal {
            return Recommendation {
                operation: RecommendedOp::Search,
                sort_recent: false,
                limit: None,
                strategy: Some(RetrievalStrategy::RecencyHeavy),
                reason: RoutingReason::Temporal,
            };
        }

        Recommendation {
            operation: RecommendedOp::Search,
            sort_recent: false,
            limit: None,
            strategy: None,
            reason: RoutingReason::Semantic,
        }
    }

    /// Default strategy for an intent when the caller asked for auto
    pub fn strategy_for_intent(&self, intent: QueryIntent) -> RetrievalStrategy {
        match intent {
            QueryIntent::Relational => RetrievalStrategy::GraphHeavy,
            QueryIntent::Temporal => RetrievalStrategy::RecencyHeavy,
            _ => RetrievalStrategy::Balanced,
        }
    }

    /// LLM-backed analysis; falls back to the keyword path on any
    /// parsing or transport error
    pub async fn analyze_with_llm(
        &self,
        scheduler: &Arc<LlmScheduler>,
        query: &str,
    ) -> RoutedQuery {
        let prompt = format!(
            "Classify this memory query. Respond with JSON only: \
             {{\"intent\": \"factual|relational|temporal|procedural|aggregation|hybrid\", \
             \"time_reference\": null, \"topics\": [], \
             \"expanded_queries\": [], \"confidence\": 0.0}}\n\nQuery: {}",
            query
        );

        match scheduler.complete_high(&prompt, true).await {
            Ok(raw) => match serde_json::from_str::<LlmQueryAnalysis>(&raw) {
                Ok(parsed) => {
                    let intent = match parsed.intent.as_str() {
                        "factual" => QueryIntent::Factual,
                        "relational" => QueryIntent::Relational,
                        "temporal" => QueryIntent::Temporal,
                        "procedural" => QueryIntent::Procedural,
                        "aggregation" => QueryIntent::Aggregation,
                        "hybrid" => QueryIntent::Hybrid,
                        other => {
                            tracing::debug!("unknown LLM intent {:?}, falling back", other);
                            return RoutedQuery {
                                analysis: self.analyze(query),
                                expanded_queries: vec![],
                            };
                        }
                    };
                    RoutedQuery {
                        analysis: IntentAnalysis {
                            intent,
                            confidence: parsed.confidence.clamp(0.0, 1.0),
                        },
                        expanded_queries: parsed.expanded_queries.into_iter().take(3).collect(),
                    }
                }
                Err(e) => {
                    tracing::debug!("LLM analysis parse failed, falling back: {}", e);
                    RoutedQuery {
                        analysis: self.analyze(query),
                        expanded_queries: vec![],
                    }
                }
            },
            Err(e) => {
                tracing::debug!("LLM analysis transport failed, falling back: {}", e);
                RoutedQuery {
                    analysis: self.analyze(query),
                    expanded_queries: vec![],
                }
            }
        }
    }
}
