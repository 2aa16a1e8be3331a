//! Novelty classification
//!
//! Decides whether incoming content is new, ambiguous, or redundant
//! against existing memories of the same category. Read-only: callers
//! act on the outcome (boost on redundant, arbitrate on ambiguous,
//! insert on new).

use std::sync::Arc;

use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::storage::{queries, EngramStore};
use crate::types::{Engram, EngramCategory, EngramFilter, NoveltyConfig};

/// Classification outcome; exactly one per input
#[derive(Debug, Clone)]
pub enum NoveltyOutcome {
    /// No sufficiently similar memory exists
    New,
    /// Similar-but-not-identical matches that need arbitration
    Ambiguous(Vec<(Engram, f32)>),
    /// An existing memory already covers this content
    Redundant(Box<Engram>),
}

impl NoveltyOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            NoveltyOutcome::New => "new",
            NoveltyOutcome::Ambiguous(_) => "ambiguous",
            NoveltyOutcome::Redundant(_) => "redundant",
        }
    }
}

/// Per-category similarity thresholds
#[derive(Debug, Clone, Copy)]
pub struct NoveltyThresholds {
    pub redundant: f32,
    pub ambiguous: f32,
}

/// Category-specific thresholds; stricter for facts, looser for plans
pub fn thresholds_for(category: EngramCategory) -> NoveltyThresholds {
    match category {
        EngramCategory::Fact => NoveltyThresholds {
            redundant: 0.95,
            ambiguous: 0.82,
        },
        EngramCategory::Observation => NoveltyThresholds {
            redundant: 0.92,
            ambiguous: 0.78,
        },
        EngramCategory::Action => NoveltyThresholds {
            redundant: 0.90,
            ambiguous: 0.75,
        },
        EngramCategory::Plan => NoveltyThresholds {
            redundant: 0.88,
            ambiguous: 0.72,
        },
        _ => NoveltyThresholds {
            redundant: 0.92,
            ambiguous: 0.78,
        },
    }
}

/// Classifies content against existing same-category memories
pub struct NoveltyClassifier {
    store: EngramStore,
    embedding: Arc<EmbeddingClient>,
    config: NoveltyConfig,
}

impl NoveltyClassifier {
    pub fn new(store: EngramStore, embedding: Arc<EmbeddingClient>, config: NoveltyConfig) -> Self {
        Self {
            store,
            embedding,
            config,
        }
    }

    /// Classify `(content, category)`; `project_id` narrows candidates
    pub async fn classify(
        &self,
        content: &str,
        category: EngramCategory,
        project_id: Option<&str>,
    ) -> Result<NoveltyOutcome> {
        if !self.config.enabled {
            return Ok(NoveltyOutcome::New);
        }

        let (query_embedding, _) = self.embedding.embed(content).await?;
        self.classify_with_embedding(&query_embedding, category, project_id)
    }

    /// Classification against a pre-computed embedding
    pub fn classify_with_embedding(
        &self,
        query_embedding: &[f32],
        category: EngramCategory,
        project_id: Option<&str>,
    ) -> Result<NoveltyOutcome> {
        if !self.config.enabled {
            return Ok(NoveltyOutcome::New);
        }

        let filter = EngramFilter {
            category: Some(category),
            project_id: project_id.map(String::from),
            ..Default::default()
        };

        let candidates = self.store.with_connection(|conn| {
            queries::vector_search(conn, query_embedding, self.config.limit * 2, None, &filter)
        })?;

        let thresholds = thresholds_for(category);
        let top_similarity = candidates.first().map(|(_, s)| *s).unwrap_or(0.0);

        if top_similarity >= thresholds.redundant {
            let (existing, _) = candidates.into_iter().next().expect("non-empty candidates");
            return Ok(NoveltyOutcome::Redundant(Box::new(existing)));
        }

        let ambiguous: Vec<(Engram, f32)> = candidates
            .into_iter()
            .filter(|(_, similarity)| *similarity >= thresholds.ambiguous)
            .collect();

        if ambiguous.is_empty() {
            Ok(NoveltyOutcome::New)
        } else {
            Ok(NoveltyOutcome::Ambiguous(ambiguous))
        }
    }
}
