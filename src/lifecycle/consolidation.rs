//! Consolidation
//!
//! Promotes working-memory items into durable engrams. Each cycle pulls
//! a bounded set of candidates, scores them on importance, access,
//! novelty, and age, and inserts the survivors through the write
//! serializer. A parallel interaction consolidator batches recorded tool
//! interactions to an LLM curator and inserts the returned candidates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::llm::LlmScheduler;
use crate::storage::{queries, EngramStore};
use crate::telemetry::{events, TelemetrySink};
use crate::types::{
    ConsolidationConfig, CreateEngramInput, EngramCategory, EngramFilter,
    InteractionConsolidationConfig,
};
use crate::working::{WorkingItem, WorkingMemory};
use crate::writer::WriteSerializer;

/// Candidates examined per cycle
const MAX_CANDIDATES_PER_CYCLE: usize = 50;

/// Nearest neighbours consulted for the novelty component
const NOVELTY_NEIGHBORS: usize = 5;

/// Outcome of one consolidation cycle
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConsolidationReport {
    pub examined: usize,
    pub promoted: usize,
    pub skipped: usize,
}

/// Promotes working-memory items to durable storage
pub struct Consolidator {
    working: Arc<WorkingMemory>,
    store: EngramStore,
    embedding: Arc<EmbeddingClient>,
    writer: Arc<WriteSerializer>,
    telemetry: Arc<dyn TelemetrySink>,
    config: ConsolidationConfig,
}

impl Consolidator {
    pub fn new(
        working: Arc<WorkingMemory>,
        store: EngramStore,
        embedding: Arc<EmbeddingClient>,
        writer: Arc<WriteSerializer>,
        telemetry: Arc<dyn TelemetrySink>,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            working,
            store,
            embedding,
            writer,
            telemetry,
            config,
        }
    }

    /// One consolidation cycle
    pub async fn run_once(&self) -> Result<ConsolidationReport> {
        if !self.config.enabled {
            return Ok(ConsolidationReport::default());
        }

        self.telemetry.emit(
            events::CONSOLIDATION_STARTED,
            &HashMap::new(),
            &serde_json::Value::Null,
        );

        let min_age = Duration::from_millis(self.config.min_age_ms);
        let candidates = self
            .working
            .get_consolidation_candidates(min_age, MAX_CANDIDATES_PER_CYCLE);

        let mut report = ConsolidationReport {
            examined: candidates.len(),
            ..Default::default()
        };

        // Score every candidate, then promote the survivors best-first
        let mut scored: Vec<(WorkingItem, Vec<f32>, f32)> = Vec::new();
        for item in candidates {
            let (vector, _) = match self.embedding.embed(&item.content).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!("skipping candidate without embedding: {}", e);
                    report.skipped += 1;
                    continue;
                }
            };
            let score = self.consolidation_score(&item, &vector)?;
            if score >= self.config.score_threshold {
                scored.push((item, vector, score));
            } else {
                report.skipped += 1;
            }
        }
        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        for (item, vector, score) in scored {
            let mut metadata = item.metadata.clone();
            metadata.insert("source".to_string(), json!("working_memory"));
            metadata.insert(
                "original_created".to_string(),
                json!(queries::format_ts(item.created_at)),
            );
            metadata.insert("consolidation_score".to_string(), json!(score));
            if let Some(tool) = &item.tool_name {
                metadata.insert("tool_name".to_string(), json!(tool));
            }

            let input = CreateEngramInput {
                content: item.content.clone(),
                category: item.category,
                importance: Some(item.importance),
                metadata,
                embedding: Some(vector),
                ..Default::default()
            };

            match self.writer.insert(input).await {
                Ok(_) => {
                    self.working.delete(&item.id);
                    report.promoted += 1;
                }
                Err(e) => {
                    tracing::warn!("consolidation insert failed: {}", e);
                    report.skipped += 1;
                }
            }
        }

        let mut measurements = HashMap::new();
        measurements.insert("examined".to_string(), report.examined as f64);
        measurements.insert("promoted".to_string(), report.promoted as f64);
        self.telemetry.emit(
            events::CONSOLIDATION_COMPLETED,
            &measurements,
            &serde_json::Value::Null,
        );

        Ok(report)
    }

    /// `0.4*importance + 0.3*min(1, access/10) + 0.2*novelty
    ///  + 0.1*min(1, age_seconds/300)`
    fn consolidation_score(&self, item: &WorkingItem, vector: &[f32]) -> Result<f32> {
        let neighbors = self.store.with_connection(|conn| {
            queries::vector_search(conn, vector, NOVELTY_NEIGHBORS, None, &EngramFilter::default())
        })?;

        let uniqueness = word_uniqueness_ratio(
            &item.content,
            &neighbors
                .iter()
                .map(|(e, _)| e.content.as_str())
                .collect::<Vec<_>>(),
        );
        let novelty = match neighbors.first() {
            Some((_, max_similarity)) => {
                // Similarity novelty blended 60/40 with word uniqueness
                0.6 * (1.0 - max_similarity).clamp(0.0, 1.0) + 0.4 * uniqueness
            }
            None => 0.8 + 0.2 * uniqueness,
        };

        let age_seconds = (Utc::now() - item.created_at).num_seconds().max(0) as f32;
        let access = (item.access_count as f32 / 10.0).min(1.0);

        Ok(0.4 * item.importance + 0.3 * access + 0.2 * novelty + 0.1 * (age_seconds / 300.0).min(1.0))
    }

    /// Run cycles on the configured interval
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_millis(self.config.interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    tracing::warn!("consolidation cycle failed: {}", e);
                }
            }
        })
    }
}

/// Fraction of the item's distinct words absent from the neighbour texts
fn word_uniqueness_ratio(content: &str, neighbor_contents: &[&str]) -> f32 {
    let words: HashSet<String> = tokenize(content);
    if words.is_empty() {
        return 0.0;
    }

    if neighbor_contents.is_empty() {
        // With nothing to compare against, fall back to the ratio of
        // distinct words to total words
        let total = content.split_whitespace().count().max(1);
        return words.len() as f32 / total as f32;
    }

    let neighbor_words: HashSet<String> = neighbor_contents
        .iter()
        .flat_map(|c| tokenize(c))
        .collect();
    let unique = words.iter().filter(|w| !neighbor_words.contains(*w)).count();
    unique as f32 / words.len() as f32
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// A recorded tool interaction awaiting curation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInteraction {
    pub id: String,
    pub tool_name: String,
    pub summary: String,
    pub occurred_at: DateTime<Utc>,
}

/// External source of recorded tool interactions
pub trait InteractionSource: Send + Sync {
    /// Interactions at least `min_age` old, up to `limit`
    fn pending(&self, min_age: Duration, limit: usize) -> Vec<ToolInteraction>;

    /// Mark interactions as consolidated
    fn mark_consolidated(&self, ids: &[String]);
}

/// One curated engram candidate from the LLM
#[derive(Debug, Clone, Deserialize)]
struct CuratedCandidate {
    content: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    importance: Option<f32>,
}

/// Outcome of one interaction-consolidation cycle
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InteractionReport {
    pub interactions: usize,
    pub inserted: usize,
}

/// Curates raw tool interactions into engrams via the LLM
pub struct InteractionConsolidator {
    source: Arc<dyn InteractionSource>,
    scheduler: Arc<LlmScheduler>,
    writer: Arc<WriteSerializer>,
    telemetry: Arc<dyn TelemetrySink>,
    config: InteractionConsolidationConfig,
}

impl InteractionConsolidator {
    pub fn new(
        source: Arc<dyn InteractionSource>,
        scheduler: Arc<LlmScheduler>,
        writer: Arc<WriteSerializer>,
        telemetry: Arc<dyn TelemetrySink>,
        config: InteractionConsolidationConfig,
    ) -> Self {
        Self {
            source,
            scheduler,
            writer,
            telemetry,
            config,
        }
    }

    /// One curation cycle
    pub async fn run_once(&self) -> Result<InteractionReport> {
        let min_age = Duration::from_secs(self.config.min_age_minutes * 60);
        let interactions = self.source.pending(min_age, self.config.batch_size);

        if interactions.len() < self.config.min_interactions {
            return Ok(InteractionReport::default());
        }

        self.telemetry.emit(
            events::INTERACTION_CONSOLIDATION_STARTED,
            &HashMap::new(),
            &serde_json::json!({ "batch": interactions.len() }),
        );

        let listing = interactions
            .iter()
            .map(|i| format!("- [{}] {}", i.tool_name, i.summary))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Distill durable memories from these tool interactions. Respond with a JSON \
             array of objects: [{{\"content\": \"...\", \"category\": \
             \"fact|action|observation|plan|episode|procedure\", \"importance\": 0.5}}]. \
             Only include knowledge worth keeping.\n\n{}",
            listing
        );

        let raw = self.scheduler.complete_low(&prompt, true).await?;
        let candidates: Vec<CuratedCandidate> = serde_json::from_str(&raw)?;

        let interaction_ids: Vec<String> = interactions.iter().map(|i| i.id.clone()).collect();
        let inputs: Vec<CreateEngramInput> = candidates
            .into_iter()
            .filter(|c| !c.content.trim().is_empty())
            .map(|candidate| {
                let mut metadata = HashMap::new();
                metadata.insert("source".to_string(), json!("interaction_consolidation"));
                metadata.insert(
                    "source_interaction_ids".to_string(),
                    json!(interaction_ids.clone()),
                );
                CreateEngramInput {
                    content: candidate.content,
                    category: candidate
                        .category
                        .as_deref()
                        .and_then(|c| c.parse().ok())
                        .unwrap_or(EngramCategory::Observation),
                    importance: candidate.importance.map(|i| i.clamp(0.0, 1.0)),
                    metadata,
                    ..Default::default()
                }
            })
            .collect();

        let inserted = if inputs.is_empty() {
            0
        } else {
            self.writer.insert_all(inputs).await?.len()
        };
        self.source.mark_consolidated(&interaction_ids);

        let mut measurements = HashMap::new();
        measurements.insert("inserted".to_string(), inserted as f64);
        self.telemetry.emit(
            events::INTERACTION_CONSOLIDATION_COMPLETED,
            &measurements,
            &serde_json::Value::Null,
        );

        Ok(InteractionReport {
            interactions: interaction_ids.len(),
            inserted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbeddingProvider;
    use crate::llm::testing::ScriptedProvider;
    use crate::telemetry::MemorySink;
    use crate::types::CircuitBreakerConfig;
    use crate::working::StoreWorkingInput;
    use parking_lot::Mutex;

    const DIM: usize = 256;

    struct Fixture {
        consolidator: Consolidator,
        working: Arc<WorkingMemory>,
        store: EngramStore,
        sink: Arc<MemorySink>,
    }

    fn fixture(config: ConsolidationConfig) -> Fixture {
        let store = EngramStore::open_in_memory().unwrap();
        let sink = Arc::new(MemorySink::new());
        let working = Arc::new(WorkingMemory::new(Default::default(), sink.clone()));
        let embedding = Arc::new(EmbeddingClient::new(
            vec![Arc::new(HashEmbeddingProvider::new(DIM))],
            DIM,
            CircuitBreakerConfig::default(),
        ));
        let writer = WriteSerializer::start(store.clone());
        let consolidator = Consolidator::new(
            working.clone(),
            store.clone(),
            embedding,
            writer,
            sink.clone(),
            config,
        );
        Fixture {
            consolidator,
            working,
            store,
            sink,
        }
    }

    fn zero_age_config() -> ConsolidationConfig {
        ConsolidationConfig {
            min_age_ms: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_promotes_candidate_to_store() {
        let fixture = fixture(zero_age_config());
        fixture.working.store(StoreWorkingInput {
            content: "team decided to adopt trunk-based development".to_string(),
            importance: Some(0.8),
            consolidation_candidate: true,
            ..Default::default()
        });

        let report = fixture.consolidator.run_once().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.promoted, 1);

        // Promoted into the store with consolidation metadata
        let engrams = fixture
            .store
            .with_connection(|conn| queries::list_recent(conn, &EngramFilter::default(), 10))
            .unwrap();
        assert_eq!(engrams.len(), 1);
        assert_eq!(
            engrams[0].metadata.get("source").and_then(|v| v.as_str()),
            Some("working_memory")
        );
        assert!(engrams[0].metadata.contains_key("consolidation_score"));
        assert!(engrams[0].has_embedding);

        // Removed from working memory
        assert_eq!(fixture.working.stats().items, 0);
        assert_eq!(fixture.sink.count(events::CONSOLIDATION_COMPLETED), 1);
    }

    #[tokio::test]
    async fn test_low_scores_are_skipped() {
        let fixture = fixture(ConsolidationConfig {
            min_age_ms: 0,
            score_threshold: 0.9,
            ..Default::default()
        });
        fixture.working.store(StoreWorkingInput {
            content: "trivial throwaway note".to_string(),
            importance: Some(0.1),
            consolidation_candidate: true,
            ..Default::default()
        });

        let report = fixture.consolidator.run_once().await.unwrap();
        assert_eq!(report.promoted, 0);
        assert_eq!(report.skipped, 1);
        // Item stays buffered until it expires
        assert_eq!(fixture.working.stats().items, 1);
    }

    #[tokio::test]
    async fn test_disabled_does_nothing() {
        let fixture = fixture(ConsolidationConfig {
            enabled: false,
            min_age_ms: 0,
            ..Default::default()
        });
        fixture.working.store(StoreWorkingInput {
            content: "anything".to_string(),
            consolidation_candidate: true,
            ..Default::default()
        });

        let report = fixture.consolidator.run_once().await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(fixture.sink.count(events::CONSOLIDATION_STARTED), 0);
    }

    #[test]
    fn test_word_uniqueness_ratio() {
        // No neighbours: distinct/total words of the item itself
        let ratio = word_uniqueness_ratio("alpha beta alpha", &[]);
        assert!((ratio - 2.0 / 3.0).abs() < 1e-6);

        // Half the distinct words appear in a neighbour
        let ratio = word_uniqueness_ratio("alpha beta", &["beta gamma"]);
        assert!((ratio - 0.5).abs() < 1e-6);

        assert_eq!(word_uniqueness_ratio("", &["x"]), 0.0);
    }

    #[derive(Default)]
    struct FakeSource {
        interactions: Mutex<Vec<ToolInteraction>>,
        consolidated: Mutex<Vec<String>>,
    }

    impl InteractionSource for FakeSource {
        fn pending(&self, _min_age: Duration, limit: usize) -> Vec<ToolInteraction> {
            self.interactions.lock().iter().take(limit).cloned().collect()
        }

        fn mark_consolidated(&self, ids: &[String]) {
            self.consolidated.lock().extend(ids.iter().cloned());
        }
    }

    #[tokio::test]
    async fn test_interaction_consolidator_curates_and_inserts() {
        let store = EngramStore::open_in_memory().unwrap();
        let sink = Arc::new(MemorySink::new());
        let writer = WriteSerializer::start(store.clone());
        let source = Arc::new(FakeSource::default());
        for i in 0..5 {
            source.interactions.lock().push(ToolInteraction {
                id: format!("int-{}", i),
                tool_name: "shell".to_string(),
                summary: format!("ran migration step {}", i),
                occurred_at: Utc::now() - chrono::Duration::minutes(10),
            });
        }

        let provider = Arc::new(ScriptedProvider::always(
            r#"[{"content": "migrations run in five steps", "category": "procedure", "importance": 0.7}]"#,
        ));
        let scheduler = LlmScheduler::start(provider);

        let consolidator = InteractionConsolidator::new(
            source.clone(),
            scheduler,
            writer,
            sink.clone(),
            InteractionConsolidationConfig::default(),
        );

        let report = consolidator.run_once().await.unwrap();
        assert_eq!(report.interactions, 5);
        assert_eq!(report.inserted, 1);
        assert_eq!(source.consolidated.lock().len(), 5);

        let engrams = store
            .with_connection(|conn| queries::list_recent(conn, &EngramFilter::default(), 10))
            .unwrap();
        assert_eq!(engrams[0].category, EngramCategory::Procedure);
        assert_eq!(
            engrams[0]
                .metadata
                .get("source")
                .and_then(|v| v.as_str()),
            Some("interaction_consolidation")
        );
        assert_eq!(sink.count(events::INTERACTION_CONSOLIDATION_COMPLETED), 1);
    }

    #[tokio::test]
    async fn test_interaction_consolidator_needs_minimum_batch() {
        let store = EngramStore::open_in_memory().unwrap();
        let sink = Arc::new(MemorySink::new());
        let writer = WriteSerializer::start(store);
        let source = Arc::new(FakeSource::default());
        source.interactions.lock().push(ToolInteraction {
            id: "solo".to_string(),
            tool_name: "shell".to_string(),
            summary: "one lonely call".to_string(),
            occurred_at: Utc::now(),
        });

        let scheduler = LlmScheduler::start(Arc::new(ScriptedProvider::always("[]")));
        let consolidator = InteractionConsolidator::new(
            source,
            scheduler,
            writer,
            sink.clone(),
            InteractionConsolidationConfig::default(),
        );

        let report = consolidator.run_once().await.unwrap();
        assert_eq!(report.interactions, 0);
        assert_eq!(sink.count(events::INTERACTION_CONSOLIDATION_STARTED), 0);
    }
}
