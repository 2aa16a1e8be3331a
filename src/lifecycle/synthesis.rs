//! Synthesizer
//!
//! Clusters related engrams by embedding similarity and asks the LLM to
//! produce a higher-level synthesis for each cluster, inserted back as a
//! high-importance fact. Cluster members are marked so they are not
//! re-synthesised. Rate limits and timeouts defer a cluster rather than
//! failing the run.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::embedding::cosine_similarity;
use crate::error::{LimbicError, Result};
use crate::llm::LlmScheduler;
use crate::storage::{queries, EngramStore};
use crate::telemetry::{events, TelemetrySink};
use crate::types::{CreateEngramInput, Engram, EngramCategory, EngramId, SynthesizerConfig};
use crate::writer::WriteSerializer;

/// Recent engrams examined per run
const SCAN_LIMIT: usize = 100;

/// Prefix required on synthesis content
const SYNTHESIS_PREFIX: &str = "SYNTHESIS: ";

/// Minimum acceptable completion length
const MIN_SYNTHESIS_CHARS: usize = 20;

/// Metadata source tag for synthesis engrams
pub const SYNTHESIS_SOURCE: &str = "autonomous_synthesis";

/// Outcome of one synthesis run
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SynthesisReport {
    pub scanned: usize,
    pub clusters: usize,
    pub synthesized: usize,
    pub deferred: usize,
}

/// Clusters engrams and writes back syntheses
pub struct Synthesizer {
    store: EngramStore,
    writer: Arc<WriteSerializer>,
    scheduler: Arc<LlmScheduler>,
    telemetry: Arc<dyn TelemetrySink>,
    config: SynthesizerConfig,
}

impl Synthesizer {
    pub fn new(
        store: EngramStore,
        writer: Arc<WriteSerializer>,
        scheduler: Arc<LlmScheduler>,
        telemetry: Arc<dyn TelemetrySink>,
        config: SynthesizerConfig,
    ) -> Self {
        Self {
            store,
            writer,
            scheduler,
            telemetry,
            config,
        }
    }

    /// One synthesis run
    pub async fn run_once(&self) -> Result<SynthesisReport> {
        if !self.config.enabled {
            return Ok(SynthesisReport::default());
        }

        self.telemetry.emit(
            events::SYNTHESIS_STARTED,
            &HashMap::new(),
            &serde_json::Value::Null,
        );

        let engrams = self
            .store
            .with_connection(|conn| queries::unsynthesized_recent(conn, SCAN_LIMIT))?;

        // Load embeddings; members without one cannot cluster
        let mut embedded: Vec<(Engram, Vec<f32>)> = Vec::new();
        for engram in engrams {
            if let Some(embedding) = self
                .store
                .with_connection(|conn| queries::get_embedding(conn, engram.id))?
            {
                embedded.push((engram, embedding));
            }
        }

        let mut report = SynthesisReport {
            scanned: embedded.len(),
            ..Default::default()
        };

        let clusters = greedy_clusters(
            &embedded,
            self.config.similarity_threshold,
            self.config.min_cluster_size,
        );
        report.clusters = clusters.len();

        for cluster in clusters.into_iter().take(self.config.max_syntheses_per_run) {
            match self.synthesize_cluster(&embedded, &cluster).await {
                Ok(()) => report.synthesized += 1,
                Err(e) if e.is_retryable() => {
                    // Rate limit or timeout: the cluster waits for the
                    // next run
                    tracing::info!("synthesis deferred: {}", e);
                    report.deferred += 1;
                }
                Err(e) => {
                    tracing::warn!("synthesis failed: {}", e);
                    report.deferred += 1;
                }
            }
        }

        let mut measurements = HashMap::new();
        measurements.insert("clusters".to_string(), report.clusters as f64);
        measurements.insert("synthesized".to_string(), report.synthesized as f64);
        self.telemetry.emit(
            events::SYNTHESIS_COMPLETED,
            &measurements,
            &serde_json::Value::Null,
        );

        Ok(report)
    }

    async fn synthesize_cluster(
        &self,
        embedded: &[(Engram, Vec<f32>)],
        member_indexes: &[usize],
    ) -> Result<()> {
        let members: Vec<&Engram> = member_indexes.iter().map(|&i| &embedded[i].0).collect();

        let listing = members
            .iter()
            .map(|e| format!("- {}", e.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "These memories appear related. Produce one concise higher-level insight \
             that captures what they collectively mean. Answer with the insight only.\n\n{}",
            listing
        );

        let completion = self.scheduler.complete_low(&prompt, false).await?;
        let trimmed = completion.trim();
        if trimmed.len() < MIN_SYNTHESIS_CHARS {
            return Err(LimbicError::Completion(format!(
                "synthesis too short ({} chars)",
                trimmed.len()
            )));
        }

        let content = if trimmed.starts_with(SYNTHESIS_PREFIX) {
            trimmed.to_string()
        } else {
            format!("{}{}", SYNTHESIS_PREFIX, trimmed)
        };

        let member_ids: Vec<EngramId> = members.iter().map(|e| e.id).collect();
        let mut metadata = HashMap::new();
        metadata.insert("source".to_string(), json!(SYNTHESIS_SOURCE));
        metadata.insert("source_memory_ids".to_string(), json!(member_ids.clone()));

        self.writer
            .insert(CreateEngramInput {
                content,
                category: EngramCategory::Fact,
                importance: Some(0.9),
                metadata,
                ..Default::default()
            })
            .await?;

        // Mark members so they are not clustered again
        let marked_at = queries::format_ts(chrono::Utc::now());
        self.writer
            .transaction(move |conn| {
                for id in &member_ids {
                    let mut patch = HashMap::new();
                    patch.insert("synthesized_at".to_string(), json!(marked_at));
                    queries::merge_metadata(conn, *id, &patch)?;
                }
                Ok(())
            })
            .await?;

        Ok(())
    }

    /// Run on the configured interval
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_millis(self.config.interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    tracing::warn!("synthesis run failed: {}", e);
                }
            }
        })
    }
}

/// Greedy clustering by cosine similarity: each unassigned engram seeds
/// a cluster of everything sufficiently similar to it
fn greedy_clusters(
    embedded: &[(Engram, Vec<f32>)],
    similarity_threshold: f32,
    min_cluster_size: usize,
) -> Vec<Vec<usize>> {
    let mut assigned = vec![false; embedded.len()];
    let mut clusters = Vec::new();

    for seed in 0..embedded.len() {
        if assigned[seed] {
            continue;
        }
        let mut cluster = vec![seed];
        for other in (seed + 1)..embedded.len() {
            if assigned[other] {
                continue;
            }
            let similarity = cosine_similarity(&embedded[seed].1, &embedded[other].1);
            if similarity >= similarity_threshold {
                cluster.push(other);
            }
        }
        if cluster.len() >= min_cluster_size {
            for &index in &cluster {
                assigned[index] = true;
            }
            clusters.push(cluster);
        }
    }

    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedProvider;
    use crate::telemetry::MemorySink;
    use crate::types::EngramFilter;

    const DIM: usize = 8;

    struct Fixture {
        synthesizer: Synthesizer,
        store: EngramStore,
        sink: Arc<MemorySink>,
    }

    fn fixture(responses: Vec<Result<String>>, config: SynthesizerConfig) -> Fixture {
        let store = EngramStore::open_in_memory().unwrap();
        let sink = Arc::new(MemorySink::new());
        let writer = WriteSerializer::start(store.clone());
        let scheduler = LlmScheduler::start(Arc::new(ScriptedProvider::new(responses)));
        let synthesizer = Synthesizer::new(store.clone(), writer, scheduler, sink.clone(), config);
        Fixture {
            synthesizer,
            store,
            sink,
        }
    }

    /// Seed an engram with a fixed embedding direction
    fn seed(store: &EngramStore, content: &str, direction: usize) -> EngramId {
        store
            .with_connection(|conn| {
                let engram = queries::create_engram(
                    conn,
                    &CreateEngramInput {
                        content: content.to_string(),
                        category: EngramCategory::Observation,
                        ..Default::default()
                    },
                )?;
                let mut v = vec![0.0f32; DIM];
                v[direction] = 1.0;
                queries::store_embedding(conn, engram.id, &v, None)?;
                Ok(engram.id)
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_synthesizes_a_cluster() {
        let fixture = fixture(
            vec![Ok(
                "these three observations show the user consistently prefers dark interfaces"
                    .to_string(),
            )],
            SynthesizerConfig::default(),
        );
        // Three engrams along the same axis form one cluster
        seed(&fixture.store, "user chose dark mode in the editor", 0);
        seed(&fixture.store, "user switched terminal to a dark theme", 0);
        seed(&fixture.store, "user asked for dark dashboards", 0);
        // An outlier stays unclustered
        seed(&fixture.store, "user speaks french", 3);

        let report = fixture.synthesizer.run_once().await.unwrap();
        assert_eq!(report.clusters, 1);
        assert_eq!(report.synthesized, 1);

        let engrams = fixture
            .store
            .with_connection(|conn| queries::list_recent(conn, &EngramFilter::default(), 10))
            .unwrap();

        let synthesis = engrams
            .iter()
            .find(|e| {
                e.metadata.get("source").and_then(|v| v.as_str()) == Some(SYNTHESIS_SOURCE)
            })
            .expect("synthesis engram inserted");
        assert!(synthesis.content.starts_with(SYNTHESIS_PREFIX));
        assert_eq!(synthesis.category, EngramCategory::Fact);
        assert_eq!(synthesis.importance, 0.9);
        let member_ids = synthesis
            .metadata
            .get("source_memory_ids")
            .and_then(|v| v.as_array().cloned())
            .unwrap();
        assert_eq!(member_ids.len(), 3);

        // Members carry the synthesized marker
        let marked = engrams
            .iter()
            .filter(|e| e.metadata.contains_key("synthesized_at"))
            .count();
        assert_eq!(marked, 3);
        assert_eq!(fixture.sink.count(events::SYNTHESIS_COMPLETED), 1);
    }

    #[tokio::test]
    async fn test_marked_members_not_rescanned() {
        let fixture = fixture(
            vec![Ok("the user standardises on dark user interface chrome".to_string())],
            SynthesizerConfig::default(),
        );
        seed(&fixture.store, "dark mode one", 0);
        seed(&fixture.store, "dark mode two", 0);
        seed(&fixture.store, "dark mode three", 0);

        fixture.synthesizer.run_once().await.unwrap();
        // Second run: members are marked and the synthesis engram is
        // excluded by source, so nothing clusters
        let report = fixture.synthesizer.run_once().await.unwrap();
        assert_eq!(report.clusters, 0);
        assert_eq!(report.synthesized, 0);
    }

    #[tokio::test]
    async fn test_short_completion_defers_cluster() {
        let fixture = fixture(vec![Ok("too short".to_string())], SynthesizerConfig::default());
        seed(&fixture.store, "alpha", 0);
        seed(&fixture.store, "beta", 0);
        seed(&fixture.store, "gamma", 0);

        let report = fixture.synthesizer.run_once().await.unwrap();
        assert_eq!(report.synthesized, 0);
        assert_eq!(report.deferred, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_defers_cluster() {
        let fixture = fixture(
            vec![Err(LimbicError::ProviderRateLimited(60))],
            SynthesizerConfig::default(),
        );
        seed(&fixture.store, "alpha", 0);
        seed(&fixture.store, "beta", 0);
        seed(&fixture.store, "gamma", 0);

        let report = fixture.synthesizer.run_once().await.unwrap();
        assert_eq!(report.deferred, 1);
        // Nothing was marked; the cluster survives for the next run
        let report = fixture.synthesizer.run_once().await.unwrap();
        assert_eq!(report.clusters, 1);
    }

    #[tokio::test]
    async fn test_disabled_is_inert() {
        let fixture = fixture(
            vec![],
            SynthesizerConfig {
                enabled: false,
                ..Default::default()
            },
        );
        let report = fixture.synthesizer.run_once().await.unwrap();
        assert_eq!(report.scanned, 0);
        assert_eq!(fixture.sink.count(events::SYNTHESIS_STARTED), 0);
    }

    #[test]
    fn test_greedy_clusters_respect_min_size() {
        let mut embedded = Vec::new();
        for i in 0..2 {
            let mut v = vec![0.0f32; DIM];
            v[0] = 1.0;
            embedded.push((
                test_engram(i, &format!("close {}", i)),
                v,
            ));
        }
        // Only two similar engrams: below min_cluster_size 3
        assert!(greedy_clusters(&embedded, 0.75, 3).is_empty());

        let mut v = vec![0.0f32; DIM];
        v[0] = 1.0;
        embedded.push((test_engram(2, "close 2"), v));
        let clusters = greedy_clusters(&embedded, 0.75, 3);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 3);
    }

    fn test_engram(id: EngramId, content: &str) -> Engram {
        Engram {
            id,
            content: content.to_string(),
            category: EngramCategory::Observation,
            importance: 0.5,
            original_importance: 0.5,
            embedding: None,
            metadata: HashMap::new(),
            access_count: 0,
            last_accessed_at: None,
            inserted_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            decay_rate: 0.005,
            protected: false,
            thread_id: None,
            project_id: "global".to_string(),
            tags: vec![],
            superseded_at: None,
            content_hash: None,
            has_embedding: true,
        }
    }
}
