//! Memory engine facade
//!
//! Wires the cooperating components together: admission with novelty
//! classification, routed hybrid retrieval with caching, and the
//! background lifecycle workers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::access::AccessTracker;
use crate::activity::ActivityTracker;
use crate::attention::{AttentionLearner, FactorContributions, FeedbackSignal};
use crate::embedding::{EmbeddingCacheStats, EmbeddingClient};
use crate::error::{LimbicError, Result};
use crate::feedback::UsageFeedback;
use crate::graph::KnowledgeGraph;
use crate::lifecycle::{Consolidator, ForgettingReport, ForgettingSweeper, Synthesizer};
use crate::llm::{CompletionProvider, LlmScheduler};
use crate::novelty::{NoveltyClassifier, NoveltyOutcome};
use crate::retrieval::{
    HybridRetriever, QueryRouter, RecommendedOp, ResultCache, ResultCacheStats, RoutingReason,
};
use crate::scoring::decay;
use crate::storage::{queries, EngramStore};
use crate::telemetry::{events, TelemetrySink};
use crate::types::*;
use crate::working::{StoreWorkingInput, WorkingItem, WorkingMemory, WorkingMemoryStats};
use crate::writer::{WriteSerializer, WriterStats};

/// Result of admitting new content
#[derive(Debug, Clone)]
pub enum AdmissionOutcome {
    /// Novel content, now persisted
    Inserted(Engram),
    /// Redundant with an existing engram, whose access was boosted
    Boosted(Engram),
    /// Similar-but-unclear matches; the caller arbitrates
    NeedsArbitration(Vec<(Engram, f32)>),
}

/// Aggregated engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub store: StoreStats,
    pub working: WorkingMemoryStats,
    pub writer: WriterStats,
    pub embedding_cache: EmbeddingCacheStats,
    pub result_cache: ResultCacheStats,
}

/// The memory engine
pub struct MemoryEngine {
    config: EngineConfig,
    store: EngramStore,
    writer: Arc<WriteSerializer>,
    embedding: Arc<EmbeddingClient>,
    telemetry: Arc<dyn TelemetrySink>,
    activity: Arc<ActivityTracker>,
    access: Arc<AccessTracker>,
    working: Arc<WorkingMemory>,
    novelty: NoveltyClassifier,
    attention: Arc<AttentionLearner>,
    feedback: Arc<UsageFeedback>,
    retriever: Arc<HybridRetriever>,
    router: QueryRouter,
    result_cache: Arc<ResultCache>,
    scheduler: Option<Arc<LlmScheduler>>,
    consolidator: Arc<Consolidator>,
    sweeper: Arc<ForgettingSweeper>,
    synthesizer: Option<Arc<Synthesizer>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MemoryEngine {
    /// Assemble an engine over a store, an embedding client, a graph
    /// back end, a telemetry sink, and an optional completion provider
    pub fn new(
        store: EngramStore,
        embedding: Arc<EmbeddingClient>,
        graph: Arc<dyn KnowledgeGraph>,
        telemetry: Arc<dyn TelemetrySink>,
        completion: Option<Arc<dyn CompletionProvider>>,
        config: EngineConfig,
    ) -> Result<Self> {
        let writer = WriteSerializer::start(store.clone());
        let activity = Arc::new(ActivityTracker::new(
            config.activity_tracker.inactivity_threshold_hours,
        ));
        activity.rebuild_from_store(&store)?;

        let access = Arc::new(AccessTracker::new(store.clone(), telemetry.clone()));
        let working = Arc::new(WorkingMemory::new(
            config.working_memory.clone(),
            telemetry.clone(),
        ));
        let novelty = NoveltyClassifier::new(store.clone(), embedding.clone(), config.novelty.clone());
        let feedback = Arc::new(UsageFeedback::new(store.clone()));
        let attention = Arc::new(AttentionLearner::new());

        let retriever = Arc::new(HybridRetriever::new(
            store.clone(),
            embedding.clone(),
            graph.clone(),
            activity.clone(),
            access.clone(),
            telemetry.clone(),
            config.retrieval.clone(),
        ));
        let result_cache = Arc::new(ResultCache::new(
            Duration::from_secs(config.retrieval.result_cache_ttl_seconds),
            config.retrieval.result_cache_max_entries,
        ));

        let scheduler = completion.map(LlmScheduler::start);

        let consolidator = Arc::new(Consolidator::new(
            working.clone(),
            store.clone(),
            embedding.clone(),
            writer.clone(),
            telemetry.clone(),
            config.consolidation.clone(),
        ));
        let sweeper = Arc::new(ForgettingSweeper::new(
            store.clone(),
            writer.clone(),
            activity.clone(),
            telemetry.clone(),
            config.forgetting.clone(),
        ));
        let synthesizer = scheduler.as_ref().map(|scheduler| {
            Arc::new(Synthesizer::new(
                store.clone(),
                writer.clone(),
                scheduler.clone(),
                telemetry.clone(),
                config.synthesizer.clone(),
            ))
        });

        Ok(Self {
            config,
            store,
            writer,
            embedding,
            telemetry,
            activity,
            access,
            working,
            novelty,
            attention,
            feedback,
            retriever,
            router: QueryRouter::new(),
            result_cache,
            scheduler,
            consolidator,
            sweeper,
            synthesizer,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Admit new content: dedup, classify novelty, persist or boost
    pub async fn admit(&self, mut input: CreateEngramInput) -> Result<AdmissionOutcome> {
        if input.content.trim().is_empty() {
            return Err(LimbicError::Validation("content must be non-empty".into()));
        }
        self.activity.register_activity();

        let embedding = match input.embedding.take() {
            Some(vector) => {
                if vector.len() != self.config.embedding_dim {
                    return Err(LimbicError::Validation(format!(
                        "embedding dimension {} does not match configured {}",
                        vector.len(),
                        self.config.embedding_dim
                    )));
                }
                vector
            }
            None => self.embedding.embed(&input.content).await?.0,
        };

        // Fast path: byte-identical content in the same category
        let hash = queries::content_hash(&input.content);
        let category = input.category;
        let duplicate = self
            .store
            .with_connection(|conn| queries::find_by_content_hash(conn, &hash, category))?;
        if let Some(existing) = duplicate {
            self.access.track(existing.id);
            return Ok(AdmissionOutcome::Boosted(existing));
        }

        match self.novelty.classify_with_embedding(
            &embedding,
            input.category,
            input.project_id.as_deref(),
        )? {
            NoveltyOutcome::New => {
                input.embedding = Some(embedding);
                let engram = self.writer.insert(input).await?;
                Ok(AdmissionOutcome::Inserted(engram))
            }
            NoveltyOutcome::Redundant(existing) => {
                self.access.track(existing.id);
                Ok(AdmissionOutcome::Boosted(*existing))
            }
            NoveltyOutcome::Ambiguous(matches) => Ok(AdmissionOutcome::NeedsArbitration(matches)),
        }
    }

    /// Routed search: intent classification, cache, hybrid retrieval,
    /// helpfulness adjustment
    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<Vec<ScoredEngram>> {
        self.activity.register_activity();

        let recommendation = self.router.recommend_operation(query);
        let analysis = self.router.analyze(query);
        self.telemetry.emit(
            events::ROUTING,
            &HashMap::new(),
            &serde_json::json!({
                "intent": analysis.intent.as_str(),
                "confidence": analysis.confidence,
                "reason": format!("{:?}", recommendation.reason),
            }),
        );

        // Strong temporal queries bypass semantic search entirely
        if recommendation.reason == RoutingReason::TemporalRedirect
            && recommendation.operation == RecommendedOp::List
        {
            let limit = options.limit.or(recommendation.limit).unwrap_or(5);
            return self.list_recent(limit, options.filter.clone());
        }

        let cache_key = ResultCache::key(query, &options);
        if !options.skip_cache {
            if let Some(cached) = self.result_cache.get(cache_key) {
                return Ok(cached);
            }
        }

        // Resolve the strategy: caller > router recommendation > intent
        let mut effective = options.clone();
        if effective.strategy.is_none() {
            effective.strategy = recommendation
                .strategy
                .or(Some(self.router.strategy_for_intent(analysis.intent)));
        }

        let mut results = self.retriever.search(query, &effective).await;

        // Expanded-query legs from the LLM analysis path, discounted
        if self.config.retrieval.use_llm_routing {
            if let Some(scheduler) = &self.scheduler {
                let routed = self.router.analyze_with_llm(scheduler, query).await;
                for expanded in routed.expanded_queries {
                    let mut extra = self.retriever.search(&expanded, &effective).await;
                    for hit in &mut extra {
                        hit.score *= 0.8;
                    }
                    results.extend(extra);
                }
                results = crate::retrieval::dedup_by_max_score(results);
            }
        }

        // Usage-feedback multiplier on the final ranking
        for result in &mut results {
            let multiplier = 0.5 + result.engram.helpfulness();
            result.score = (result.score * multiplier).clamp(0.0, 1.0);
        }
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.engram.id.cmp(&b.engram.id))
        });
        if let Some(min_score) = options.min_score {
            results.retain(|r| r.score >= min_score);
        }
        results.truncate(options.limit.unwrap_or(10));

        let ids: Vec<EngramId> = results
            .iter()
            .map(|r| r.engram.id)
            .filter(|&id| id > 0)
            .collect();
        self.feedback.on_retrieved(&ids);

        if !options.skip_cache {
            self.result_cache.put(cache_key, results.clone());
        }
        Ok(results)
    }

    /// Newest engrams, scored by decayed relevance
    pub fn list_recent(&self, limit: usize, filter: EngramFilter) -> Result<Vec<ScoredEngram>> {
        let engrams = self
            .store
            .with_connection(|conn| queries::list_recent(conn, &filter, limit))?;
        Ok(engrams
            .into_iter()
            .map(|engram| {
                let reference = engram.last_accessed_at.unwrap_or(engram.inserted_at);
                let active_days = self.activity.active_days_since(reference);
                let score = decay::calculate_score(&engram, active_days);
                ScoredEngram {
                    engram,
                    score,
                    source: RetrievalSource::Recency,
                }
            })
            .collect())
    }

    /// Fetch one engram
    pub fn get(&self, id: EngramId) -> Result<Engram> {
        self.store.with_connection(|conn| queries::get_engram(conn, id))
    }

    /// Update an engram through the serializer
    pub async fn update(&self, id: EngramId, input: UpdateEngramInput) -> Result<Engram> {
        let engram = self.writer.update(id, input).await?;
        self.result_cache.invalidate_for_engram(id);
        Ok(engram)
    }

    /// Delete an engram through the serializer
    pub async fn delete(&self, id: EngramId) -> Result<bool> {
        let removed = self.writer.delete(id).await?;
        self.result_cache.invalidate_for_engram(id);
        Ok(removed)
    }

    /// Admin: exempt an engram from forgetting
    pub async fn protect(&self, id: EngramId) -> Result<Engram> {
        self.set_protected(id, true).await
    }

    /// Admin: re-enable forgetting for an engram
    pub async fn unprotect(&self, id: EngramId) -> Result<Engram> {
        self.set_protected(id, false).await
    }

    async fn set_protected(&self, id: EngramId, protected: bool) -> Result<Engram> {
        self.writer
            .update(
                id,
                UpdateEngramInput {
                    protected: Some(protected),
                    ..Default::default()
                },
            )
            .await
    }

    /// Mark an engram superseded without deleting it
    pub async fn supersede(&self, id: EngramId) -> Result<()> {
        self.writer
            .transaction(move |conn| queries::supersede(conn, id))
            .await?;
        self.result_cache.invalidate_for_engram(id);
        Ok(())
    }

    /// Buffer a short-lived memory in working memory
    pub fn remember_working(&self, input: StoreWorkingInput) -> WorkingItem {
        self.activity.register_activity();
        self.working.store(input)
    }

    /// Record retrieval feedback: adjusts attention weights and the
    /// engram's helpfulness
    pub fn record_feedback(
        &self,
        signal: FeedbackSignal,
        id: EngramId,
        contributions: &FactorContributions,
        session: Option<&str>,
    ) -> Result<()> {
        self.attention.record_feedback(signal, contributions);
        match signal {
            FeedbackSignal::Positive => {
                self.feedback.signal_useful(id, session)?;
            }
            FeedbackSignal::Negative => {
                self.feedback.signal_noise(id, session)?;
            }
            FeedbackSignal::Neutral => {}
        }
        Ok(())
    }

    /// When an engram will decay past the forgetting threshold
    pub fn predict_forgetting(&self, id: EngramId) -> Result<decay::ForgettingHorizon> {
        let engram = self.get(id)?;
        Ok(decay::predict_forgetting(
            &engram,
            self.config.forgetting.threshold,
        ))
    }

    /// Run one forgetting sweep immediately
    pub async fn sweep_now(&self, dry_run: Option<bool>) -> Result<ForgettingReport> {
        self.sweeper.run_once(dry_run).await
    }

    /// Run one consolidation cycle immediately
    pub async fn consolidate_now(&self) -> Result<crate::lifecycle::ConsolidationReport> {
        self.consolidator.run_once().await
    }

    /// Start the background workers
    pub fn start_background(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        tasks.push(self.access.clone().spawn());
        tasks.push(self.feedback.clone().spawn());
        tasks.push(
            self.working
                .clone()
                .spawn_expiry_sweeper(Duration::from_secs(60)),
        );
        if self.config.consolidation.enabled {
            tasks.push(self.consolidator.clone().spawn());
        }
        if self.config.forgetting.enabled {
            tasks.push(self.sweeper.clone().spawn());
        }
        if let Some(synthesizer) = &self.synthesizer {
            if self.config.synthesizer.enabled {
                tasks.push(synthesizer.clone().spawn());
            }
        }

        {
            let cache = self.result_cache.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(60));
                loop {
                    ticker.tick().await;
                    cache.remove_expired();
                }
            }));
        }
    }

    /// Stop the background workers
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Aggregated statistics
    pub fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            store: self.store.with_connection(queries::store_stats)?,
            working: self.working.stats(),
            writer: self.writer.stats(),
            embedding_cache: self.embedding.cache_stats(),
            result_cache: self.result_cache.stats(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    pub fn access(&self) -> &Arc<AccessTracker> {
        &self.access
    }

    pub fn working(&self) -> &Arc<WorkingMemory> {
        &self.working
    }

    pub fn attention(&self) -> &Arc<AttentionLearner> {
        &self.attention
    }

    pub fn feedback(&self) -> &Arc<UsageFeedback> {
        &self.feedback
    }

    pub fn writer(&self) -> &Arc<WriteSerializer> {
        &self.writer
    }

    pub fn store(&self) -> &EngramStore {
        &self.store
    }
}

impl Drop for MemoryEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
