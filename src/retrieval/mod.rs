//! Hybrid retrieval
//!
//! Fans out five searches in parallel — vector, graph, recency, lexical,
//! and spreading activation — each with an independent timeout. Legs
//! that time out or crash contribute the empty set; no leg failure
//! aborts the query. Results are deduplicated, filtered, scored, and
//! ranked.

pub mod cache;
pub mod router;

pub use cache::{ResultCache, ResultCacheStats};
pub use router::{QueryIntent, QueryRouter, Recommendation, RecommendedOp, RoutingReason};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::access::AccessTracker;
use crate::activity::ActivityTracker;
use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::graph::KnowledgeGraph;
use crate::scoring::hybrid::{score as hybrid_score, ScoreInputs, StrategyWeights};
use crate::storage::{queries, EngramStore};
use crate::telemetry::{events, TelemetrySink};
use crate::types::{
    Engram, EngramCategory, EngramFilter, EngramId, RetrievalConfig, RetrievalSource,
    RetrievalStrategy, ScoredEngram, SearchOptions,
};

/// How many vector hits seed the spreading-activation walk
const SPREADING_SEEDS: usize = 5;

/// One raw hit from a retrieval leg
#[derive(Debug, Clone)]
struct LegHit {
    engram: Engram,
    /// Leg-supplied similarity surrogate, when the leg has one
    similarity: Option<f32>,
    source: RetrievalSource,
}

/// Identity for deduplication: store id, or content hash for synthetic
/// records that never hit the store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DedupKey {
    Id(EngramId),
    Hash(String),
}

fn dedup_key(engram: &Engram) -> DedupKey {
    if engram.id > 0 {
        DedupKey::Id(engram.id)
    } else {
        DedupKey::Hash(queries::content_hash(&engram.content))
    }
}

/// Parallel multi-source retriever
pub struct HybridRetriever {
    store: EngramStore,
    embedding: Arc<EmbeddingClient>,
    graph: Arc<dyn KnowledgeGraph>,
    activity: Arc<ActivityTracker>,
    access: Arc<AccessTracker>,
    telemetry: Arc<dyn TelemetrySink>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        store: EngramStore,
        embedding: Arc<EmbeddingClient>,
        graph: Arc<dyn KnowledgeGraph>,
        activity: Arc<ActivityTracker>,
        access: Arc<AccessTracker>,
        telemetry: Arc<dyn TelemetrySink>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedding,
            graph,
            activity,
            access,
            telemetry,
            config,
        }
    }

    /// Top-level search; never raises — a total leg wipe-out yields an
    /// empty list
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Vec<ScoredEngram> {
        let started = std::time::Instant::now();
        self.telemetry.emit(
            events::HYBRID_SEARCH_STARTED,
            &HashMap::new(),
            &serde_json::json!({ "query_len": query.len() }),
        );

        let limit = options.limit.unwrap_or(10);
        let strategy = options.strategy.unwrap_or(RetrievalStrategy::Balanced);
        let weights = StrategyWeights::for_strategy(strategy);
        let min_score = options.min_score.unwrap_or(0.0);

        // Merge the time window into the store-level filter
        let mut filter = options.filter.clone();
        if filter.inserted_after.is_none() {
            filter.inserted_after = options.from_date;
        }
        if filter.inserted_before.is_none() {
            filter.inserted_before = options.to_date;
        }

        // Query embedding is best-effort; without it the vector and
        // spreading legs are skipped
        let query_embedding: Option<Vec<f32>> = match self.embedding.embed(query).await {
            Ok((vector, _)) => Some(vector),
            Err(e) => {
                tracing::debug!("query embedding unavailable, skipping vector legs: {}", e);
                None
            }
        };

        let hits = self
            .fan_out(query, query_embedding.as_deref(), limit, &filter)
            .await;

        let mut results = self
            .score_and_rank(hits, query_embedding.as_deref(), &filter, &weights)
            .await;

        results.retain(|r| r.score >= min_score);
        results.truncate(limit);

        if options.track_access {
            let ids: Vec<EngramId> = results
                .iter()
                .map(|r| r.engram.id)
                .filter(|&id| id > 0)
                .collect();
            self.access.track_many(&ids);
        }

        let mut measurements = HashMap::new();
        measurements.insert("results".to_string(), results.len() as f64);
        measurements.insert(
            "duration_ms".to_string(),
            started.elapsed().as_millis() as f64,
        );
        self.telemetry.emit(
            events::HYBRID_SEARCH_COMPLETED,
            &measurements,
            &serde_json::json!({ "strategy": strategy.as_str() }),
        );

        results
    }

    /// Run the five legs in parallel with independent timeouts
    async fn fan_out(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        limit: usize,
        filter: &EngramFilter,
    ) -> Vec<LegHit> {
        let timeout = Duration::from_millis(self.config.leg_timeout_ms);
        let own_limit = (limit * 2).max(10);

        let vector_leg = {
            let store = self.store.clone();
            let embedding = query_embedding.map(|v| v.to_vec());
            let filter = filter.clone();
            run_leg("vector", timeout, async move {
                let Some(embedding) = embedding else {
                    return Ok(vec![]);
                };
                let hits = store.with_connection(|conn| {
                    queries::vector_search(conn, &embedding, own_limit, None, &filter)
                })?;
                Ok(hits
                    .into_iter()
                    .map(|(engram, similarity)| LegHit {
                        engram,
                        similarity: Some(similarity),
                        source: RetrievalSource::Vector,
                    })
                    .collect())
            })
        };

        let graph_leg = {
            let graph = self.graph.clone();
            let query = query.to_string();
            run_leg("graph", timeout, async move {
                let triples = graph.query_related(&query, own_limit).await?;
                Ok(triples
                    .into_iter()
                    .map(|triple| LegHit {
                        engram: synthetic_engram(triple.to_text()),
                        similarity: None,
                        source: RetrievalSource::Graph,
                    })
                    .collect())
            })
        };

        let recency_leg = {
            let store = self.store.clone();
            let filter = filter.clone();
            run_leg("recency", timeout, async move {
                let engrams =
                    store.with_connection(|conn| queries::list_recent(conn, &filter, own_limit))?;
                Ok(engrams
                    .into_iter()
                    .map(|engram| LegHit {
                        engram,
                        similarity: None,
                        source: RetrievalSource::Recency,
                    })
                    .collect())
            })
        };

        let lexical_leg = {
            let store = self.store.clone();
            let query = query.to_string();
            let filter = filter.clone();
            run_leg("lexical", timeout, async move {
                let hits = store
                    .with_connection(|conn| queries::lexical_search(conn, &query, own_limit, &filter))?;
                Ok(hits
                    .into_iter()
                    .map(|(engram, _)| LegHit {
                        engram,
                        similarity: None,
                        source: RetrievalSource::Lexical,
                    })
                    .collect())
            })
        };

        let spreading_leg = {
            let store = self.store.clone();
            let graph = self.graph.clone();
            let embedding = query_embedding.map(|v| v.to_vec());
            let filter = filter.clone();
            let hop_decay = self.config.spreading_hop_decay;
            let max_hops = self.config.spreading_max_hops;
            run_leg("spreading_activation", timeout, async move {
                let Some(embedding) = embedding else {
                    return Ok(vec![]);
                };
                spreading_activation(
                    &store, &graph, &embedding, &filter, limit, hop_decay, max_hops,
                )
                .await
            })
        };

        let (vector, graph, recency, lexical, spreading) =
            tokio::join!(vector_leg, graph_leg, recency_leg, lexical_leg, spreading_leg);

        let mut hits = Vec::new();
        hits.extend(vector);
        hits.extend(graph);
        hits.extend(recency);
        hits.extend(lexical);
        hits.extend(spreading);
        hits
    }

    /// Score every hit, then deduplicate keeping the highest score
    async fn score_and_rank(
        &self,
        hits: Vec<LegHit>,
        query_embedding: Option<&[f32]>,
        filter: &EngramFilter,
        weights: &StrategyWeights,
    ) -> Vec<ScoredEngram> {
        // Graph connectivity per unique real id, clamped to [0, 1]
        let mut connectivity: HashMap<EngramId, f32> = HashMap::new();
        for hit in &hits {
            let id = hit.engram.id;
            if id > 0 && !connectivity.contains_key(&id) {
                let connections = self.graph.count_connections(id).await.unwrap_or(0);
                connectivity.insert(id, (connections as f32 / 10.0).min(1.0));
            }
        }

        let now = Utc::now();
        let mut scored: Vec<ScoredEngram> = Vec::with_capacity(hits.len());
        for mut hit in hits {
            if !filter.matches(&hit.engram) && hit.engram.id > 0 {
                continue;
            }

            // Load the stored embedding for hits whose leg did not carry
            // one, so the vector component treats all legs equally
            if hit.similarity.is_none()
                && hit.engram.embedding.is_none()
                && hit.engram.has_embedding
                && query_embedding.is_some()
            {
                if let Ok(Some(embedding)) = self
                    .store
                    .with_connection(|conn| queries::get_embedding(conn, hit.engram.id))
                {
                    hit.engram.embedding = Some(embedding);
                }
            }

            let reference = hit.engram.last_accessed_at.unwrap_or(hit.engram.inserted_at);
            let active_days = self.activity.active_days_between(reference, now);

            let inputs = ScoreInputs {
                query_embedding,
                vector_similarity: hit.similarity,
                graph_score: connectivity.get(&hit.engram.id).copied(),
                active_days,
            };
            let score = hybrid_score(&hit.engram, &inputs, weights);
            scored.push(ScoredEngram {
                engram: hit.engram,
                score,
                source: hit.source,
            });
        }

        dedup_by_max_score(scored)
    }
}

/// Run one leg to completion within its timeout; timeouts and crashes
/// are absorbed as the empty set
async fn run_leg<F>(name: &'static str, timeout: Duration, leg: F) -> Vec<LegHit>
where
    F: std::future::Future<Output = Result<Vec<LegHit>>> + Send + 'static,
{
    let handle = tokio::spawn(leg);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(hits))) => hits,
        Ok(Ok(Err(e))) => {
            tracing::warn!("{} leg failed: {}", name, e);
            vec![]
        }
        Ok(Err(join_error)) => {
            tracing::warn!("{} leg crashed: {}", name, join_error);
            vec![]
        }
        Err(_) => {
            tracing::warn!("{} leg timed out after {:?}", name, timeout);
            vec![]
        }
    }
}

/// A memory-shaped record for graph triples that have no store identity
fn synthetic_engram(content: String) -> Engram {
    let now = Utc::now();
    Engram {
        id: 0,
        content,
        category: EngramCategory::Fact,
        importance: 0.5,
        original_importance: 0.5,
        embedding: None,
        metadata: HashMap::new(),
        access_count: 0,
        last_accessed_at: None,
        inserted_at: now,
        updated_at: now,
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

/// Bounded breadth-first walk of the memory graph, seeded with the top
/// vector hits; activation decays per hop and stands in for similarity
async fn spreading_activation(
    store: &EngramStore,
    graph: &Arc<dyn KnowledgeGraph>,
    query_embedding: &[f32],
    filter: &EngramFilter,
    limit: usize,
    hop_decay: f32,
    max_hops: usize,
) -> Result<Vec<LegHit>> {
    let seeds = store.with_connection(|conn| {
        queries::vector_search(conn, query_embedding, SPREADING_SEEDS, None, filter)
    })?;
    if seeds.is_empty() {
        return Ok(vec![]);
    }

    // Highest activation seen per node; seeds start at their similarity
    let mut activation: HashMap<EngramId, f32> = HashMap::new();
    let mut frontier: Vec<(EngramId, f32)> = Vec::new();
    for (engram, similarity) in &seeds {
        activation.insert(engram.id, *similarity);
        frontier.push((engram.id, *similarity));
    }

    for _ in 0..max_hops {
        let mut next_frontier: Vec<(EngramId, f32)> = Vec::new();
        for (id, current) in frontier.drain(..) {
            let neighbors = graph.neighbors(id, limit).await.unwrap_or_default();
            for (neighbor, edge_weight) in neighbors {
                let spread = current * hop_decay * edge_weight.clamp(0.0, 1.0);
                if spread <= f32::EPSILON {
                    continue;
                }
                let entry = activation.entry(neighbor).or_insert(0.0);
                if spread > *entry {
                    *entry = spread;
                    next_frontier.push((neighbor, spread));
                }
            }
        }
        // Keep the walk bounded: only the strongest activations expand
        next_frontier
            .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        next_frontier.truncate(limit);
        frontier = next_frontier;
        if frontier.is_empty() {
            break;
        }
    }

    // Top-k activated nodes become leg hits
    let mut ranked: Vec<(EngramId, f32)> = activation.into_iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(limit);

    let mut hits = Vec::new();
    for (id, activation) in ranked {
        match store.with_connection(|conn| queries::get_engram(conn, id)) {
            Ok(engram) => hits.push(LegHit {
                engram,
                similarity: Some(activation.clamp(0.0, 1.0)),
                source: RetrievalSource::SpreadingActivation,
            }),
            Err(_) => continue,
        }
    }
    Ok(hits)
}

/// Deduplicate by identity, keeping the highest-scored instance; stable
/// and idempotent
pub fn dedup_by_max_score(results: Vec<ScoredEngram>) -> Vec<ScoredEngram> {
    let mut best: HashMap<DedupKey, ScoredEngram> = HashMap::new();
    for result in results {
        let key = dedup_key(&result.engram);
        match best.get(&key) {
            Some(existing) if existing.score >= result.score => {}
            _ => {
                best.insert(key, result);
            }
        }
    }

    let mut deduped: Vec<ScoredEngram> = best.into_values().collect();
    deduped.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.engram.id.cmp(&b.engram.id))
    });
    deduped
}
