//! Core types for Limbic

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for an engram
pub type EngramId = i64;

/// An engram — the universal memory unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engram {
    /// Unique identifier
    pub id: EngramId,
    /// Main content of the memory (non-empty)
    pub content: String,
    /// Category classification
    pub category: EngramCategory,
    /// Current importance score (0.0 - 1.0)
    #[serde(default = "default_importance")]
    pub importance: f32,
    /// Importance at creation time; immutable after the first insert
    pub original_importance: f32,
    /// Dense vector embedding (fixed dimension, float form)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Arbitrary metadata as JSON
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Number of times accessed
    #[serde(default)]
    pub access_count: i64,
    /// When the engram was last accessed
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// When the engram was created
    pub inserted_at: DateTime<Utc>,
    /// When the engram was last updated
    pub updated_at: DateTime<Utc>,
    /// Exponential decay rate (0.0 - 1.0), derived from importance on
    /// insert unless explicitly provided
    pub decay_rate: f32,
    /// Protected engrams are exempt from forgetting
    #[serde(default)]
    pub protected: bool,
    /// Conversation thread soft scope
    pub thread_id: Option<String>,
    /// Project soft scope
    #[serde(default = "default_project")]
    pub project_id: String,
    /// Tags for categorization
    #[serde(default)]
    pub tags: Vec<String>,
    /// If present, the engram is inactive and excluded from retrieval
    pub superseded_at: Option<DateTime<Utc>>,
    /// SHA-256 of trimmed content, used for dedup and embedding cache keys
    pub content_hash: Option<String>,
    /// Whether a float embedding is stored
    #[serde(default)]
    pub has_embedding: bool,
}

impl Engram {
    /// True iff the engram participates in retrieval
    pub fn is_active(&self) -> bool {
        self.superseded_at.is_none()
    }

    /// Helpfulness score from metadata (default 0.5)
    pub fn helpfulness(&self) -> f32 {
        self.metadata
            .get("helpfulness_score")
            .and_then(|v| v.as_f64())
            .map(|v| v as f32)
            .unwrap_or(0.5)
    }
}

fn default_importance() -> f32 {
    0.5
}

fn default_project() -> String {
    "global".to_string()
}

/// Engram category — the closed classification set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngramCategory {
    #[default]
    Fact,
    Action,
    Observation,
    Plan,
    Episode,
    Procedure,
    EntityAnchor,
}

impl EngramCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngramCategory::Fact => "fact",
            EngramCategory::Action => "action",
            EngramCategory::Observation => "observation",
            EngramCategory::Plan => "plan",
            EngramCategory::Episode => "episode",
            EngramCategory::Procedure => "procedure",
            EngramCategory::EntityAnchor => "entity_anchor",
        }
    }

    pub fn all() -> &'static [EngramCategory] {
        &[
            EngramCategory::Fact,
            EngramCategory::Action,
            EngramCategory::Observation,
            EngramCategory::Plan,
            EngramCategory::Episode,
            EngramCategory::Procedure,
            EngramCategory::EntityAnchor,
        ]
    }
}

impl std::fmt::Display for EngramCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EngramCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fact" => Ok(EngramCategory::Fact),
            "action" => Ok(EngramCategory::Action),
            "observation" => Ok(EngramCategory::Observation),
            "plan" => Ok(EngramCategory::Plan),
            "episode" => Ok(EngramCategory::Episode),
            "procedure" => Ok(EngramCategory::Procedure),
            "entity_anchor" => Ok(EngramCategory::EntityAnchor),
            _ => Err(format!("Unknown engram category: {}", s)),
        }
    }
}

/// Input for creating a new engram
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateEngramInput {
    pub content: String,
    #[serde(default)]
    pub category: EngramCategory,
    pub importance: Option<f32>,
    /// Decay rate override; derived from importance when absent
    pub decay_rate: Option<f32>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub thread_id: Option<String>,
    pub project_id: Option<String>,
    #[serde(default)]
    pub protected: bool,
    /// Pre-computed embedding; fetched from the embedding client when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Input for updating an engram
///
/// `original_importance` is intentionally absent: it is immutable.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateEngramInput {
    pub content: Option<String>,
    pub category: Option<EngramCategory>,
    pub importance: Option<f32>,
    pub decay_rate: Option<f32>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    pub tags: Option<Vec<String>>,
    pub protected: Option<bool>,
    /// Use Some(None) to clear supersession
    pub superseded_at: Option<Option<DateTime<Utc>>>,
}

/// Filters applied to store reads and retrieval results
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngramFilter {
    pub category: Option<EngramCategory>,
    pub project_id: Option<String>,
    pub thread_id: Option<String>,
    pub tags: Option<Vec<String>>,
    /// Include superseded engrams (default: false)
    #[serde(default)]
    pub include_superseded: bool,
    pub protected: Option<bool>,
    /// inserted_at lower bound (inclusive)
    pub inserted_after: Option<DateTime<Utc>>,
    /// inserted_at upper bound (inclusive)
    pub inserted_before: Option<DateTime<Utc>>,
}

impl EngramFilter {
    /// True iff the engram passes every set predicate
    pub fn matches(&self, engram: &Engram) -> bool {
        if let Some(category) = self.category {
            if engram.category != category {
                return false;
            }
        }
        if let Some(ref project) = self.project_id {
            if &engram.project_id != project {
                return false;
            }
        }
        if let Some(ref thread) = self.thread_id {
            if engram.thread_id.as_ref() != Some(thread) {
                return false;
            }
        }
        if let Some(ref tags) = self.tags {
            if !tags.iter().all(|t| engram.tags.contains(t)) {
                return false;
            }
        }
        if !self.include_superseded && engram.superseded_at.is_some() {
            return false;
        }
        if let Some(protected) = self.protected {
            if engram.protected != protected {
                return false;
            }
        }
        if let Some(after) = self.inserted_after {
            if engram.inserted_at < after {
                return false;
            }
        }
        if let Some(before) = self.inserted_before {
            if engram.inserted_at > before {
                return false;
            }
        }
        true
    }
}

/// Named weight vector over the hybrid-score components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    #[default]
    Balanced,
    VectorHeavy,
    GraphHeavy,
    RecencyHeavy,
}

impl RetrievalStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalStrategy::Balanced => "balanced",
            RetrievalStrategy::VectorHeavy => "vector_heavy",
            RetrievalStrategy::GraphHeavy => "graph_heavy",
            RetrievalStrategy::RecencyHeavy => "recency_heavy",
        }
    }
}

impl std::str::FromStr for RetrievalStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "balanced" => Ok(RetrievalStrategy::Balanced),
            "vector_heavy" => Ok(RetrievalStrategy::VectorHeavy),
            "graph_heavy" => Ok(RetrievalStrategy::GraphHeavy),
            "recency_heavy" => Ok(RetrievalStrategy::RecencyHeavy),
            _ => Err(format!("Unknown retrieval strategy: {}", s)),
        }
    }
}

/// Options for hybrid retrieval
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    /// Force a strategy; None lets the router pick
    pub strategy: Option<RetrievalStrategy>,
    pub min_score: Option<f32>,
    #[serde(default)]
    pub filter: EngramFilter,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    /// Record an access event for each returned engram
    #[serde(default)]
    pub track_access: bool,
    /// Bypass the result cache
    #[serde(default)]
    pub skip_cache: bool,
}

/// A retrieval hit: the engram plus its hybrid score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredEngram {
    pub engram: Engram,
    pub score: f32,
    /// Which retrieval leg produced this instance
    pub source: RetrievalSource,
}

/// Which fan-out leg a retrieval hit came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalSource {
    Vector,
    Graph,
    Recency,
    Lexical,
    SpreadingActivation,
    Cache,
}

impl RetrievalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalSource::Vector => "vector",
            RetrievalSource::Graph => "graph",
            RetrievalSource::Recency => "recency",
            RetrievalSource::Lexical => "lexical",
            RetrievalSource::SpreadingActivation => "spreading_activation",
            RetrievalSource::Cache => "cache",
        }
    }
}

/// Quantised int8 embedding form
///
/// `value[i] ≈ bytes[i] as f32 * scale + offset`. Reconstruction must
/// preserve cosine similarity within 1e-3 of the float form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizedEmbedding {
    pub bytes: Vec<i8>,
    pub scale: f32,
    pub offset: f32,
}

impl QuantizedEmbedding {
    /// Quantise a float embedding to int8
    pub fn from_floats(values: &[f32]) -> Self {
        let min = values.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let (min, max) = if values.is_empty() { (0.0, 0.0) } else { (min, max) };
        let scale = if (max - min).abs() < f32::EPSILON {
            1.0
        } else {
            (max - min) / 255.0
        };
        let offset = (max + min) / 2.0;
        let bytes = values
            .iter()
            .map(|&v| (((v - offset) / scale).round().clamp(-128.0, 127.0)) as i8)
            .collect();
        Self { bytes, scale, offset }
    }

    /// Reconstruct the float form
    pub fn to_floats(&self) -> Vec<f32> {
        self.bytes
            .iter()
            .map(|&b| b as f32 * self.scale + self.offset)
            .collect()
    }
}

/// Binary (sign-bit) embedding form, one bit per dimension
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryEmbedding {
    pub bits: Vec<u8>,
    pub dimensions: usize,
}

impl BinaryEmbedding {
    pub fn from_floats(values: &[f32]) -> Self {
        let mut bits = vec![0u8; values.len().div_ceil(8)];
        for (i, &v) in values.iter().enumerate() {
            if v > 0.0 {
                bits[i / 8] |= 1 << (i % 8);
            }
        }
        Self {
            bits,
            dimensions: values.len(),
        }
    }

    /// Hamming-based similarity surrogate in [0, 1]
    pub fn similarity(&self, other: &BinaryEmbedding) -> f32 {
        if self.dimensions != other.dimensions || self.dimensions == 0 {
            return 0.0;
        }
        let matching: u32 = self
            .bits
            .iter()
            .zip(other.bits.iter())
            .map(|(a, b)| (!(a ^ b)).count_ones())
            .sum();
        // Trailing pad bits always match; subtract them out
        let pad = self.bits.len() * 8 - self.dimensions;
        (matching as usize - pad) as f32 / self.dimensions as f32
    }
}

/// Statistics about the engram store
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreStats {
    pub total_engrams: i64,
    pub active_engrams: i64,
    pub protected_engrams: i64,
    pub engrams_with_embeddings: i64,
    pub db_size_bytes: i64,
    pub category_counts: HashMap<String, i64>,
    pub project_counts: HashMap<String, i64>,
}

/// Configuration for the memory engine (§6 keys with defaults)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    #[serde(default = "default_max_dim")]
    pub max_dim: usize,
    #[serde(default)]
    pub working_memory: WorkingMemoryConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    #[serde(default)]
    pub forgetting: ForgettingConfig,
    #[serde(default)]
    pub synthesizer: SynthesizerConfig,
    #[serde(default)]
    pub activity_tracker: ActivityTrackerConfig,
    #[serde(default)]
    pub interaction_consolidation: InteractionConsolidationConfig,
    #[serde(default)]
    pub novelty: NoveltyConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            embedding_dim: default_embedding_dim(),
            max_dim: default_max_dim(),
            working_memory: WorkingMemoryConfig::default(),
            consolidation: ConsolidationConfig::default(),
            forgetting: ForgettingConfig::default(),
            synthesizer: SynthesizerConfig::default(),
            activity_tracker: ActivityTrackerConfig::default(),
            interaction_consolidation: InteractionConsolidationConfig::default(),
            novelty: NoveltyConfig::default(),
            retrieval: RetrievalConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

fn default_embedding_dim() -> usize {
    256
}

fn default_max_dim() -> usize {
    1024
}

/// Working-memory buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingMemoryConfig {
    #[serde(default = "default_wm_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_wm_max_items")]
    pub max_items: usize,
}

impl Default for WorkingMemoryConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_wm_ttl(),
            max_items: default_wm_max_items(),
        }
    }
}

fn default_wm_ttl() -> u64 {
    600
}

fn default_wm_max_items() -> usize {
    100
}

/// Consolidation worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_consolidation_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_consolidation_threshold")]
    pub score_threshold: f32,
    #[serde(default = "default_consolidation_min_age")]
    pub min_age_ms: u64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_consolidation_interval(),
            score_threshold: default_consolidation_threshold(),
            min_age_ms: default_consolidation_min_age(),
        }
    }
}

fn default_consolidation_interval() -> u64 {
    60_000
}

fn default_consolidation_threshold() -> f32 {
    0.3
}

fn default_consolidation_min_age() -> u64 {
    30_000
}

/// Forgetting sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgettingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_forgetting_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_forgetting_threshold")]
    pub threshold: f32,
    #[serde(default = "default_forgetting_batch")]
    pub batch_size: usize,
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for ForgettingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_forgetting_interval(),
            threshold: default_forgetting_threshold(),
            batch_size: default_forgetting_batch(),
            dry_run: false,
        }
    }
}

fn default_forgetting_interval() -> u64 {
    3_600_000
}

fn default_forgetting_threshold() -> f32 {
    0.1
}

fn default_forgetting_batch() -> usize {
    1000
}

/// Synthesizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_synth_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_synth_min_cluster")]
    pub min_cluster_size: usize,
    #[serde(default = "default_synth_similarity")]
    pub similarity_threshold: f32,
    #[serde(default = "default_synth_max_per_run")]
    pub max_syntheses_per_run: usize,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_synth_interval(),
            min_cluster_size: default_synth_min_cluster(),
            similarity_threshold: default_synth_similarity(),
            max_syntheses_per_run: default_synth_max_per_run(),
        }
    }
}

fn default_synth_interval() -> u64 {
    300_000
}

fn default_synth_min_cluster() -> usize {
    3
}

fn default_synth_similarity() -> f32 {
    0.75
}

fn default_synth_max_per_run() -> usize {
    5
}

/// Activity tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityTrackerConfig {
    #[serde(default = "default_inactivity_hours")]
    pub inactivity_threshold_hours: u64,
}

impl Default for ActivityTrackerConfig {
    fn default() -> Self {
        Self {
            inactivity_threshold_hours: default_inactivity_hours(),
        }
    }
}

fn default_inactivity_hours() -> u64 {
    24
}

/// Interaction consolidation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionConsolidationConfig {
    #[serde(default = "default_interaction_batch")]
    pub batch_size: usize,
    #[serde(default = "default_min_interactions")]
    pub min_interactions: usize,
    #[serde(default = "default_interaction_min_age")]
    pub min_age_minutes: u64,
}

impl Default for InteractionConsolidationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_interaction_batch(),
            min_interactions: default_min_interactions(),
            min_age_minutes: default_interaction_min_age(),
        }
    }
}

fn default_interaction_batch() -> usize {
    20
}

fn default_min_interactions() -> usize {
    5
}

fn default_interaction_min_age() -> u64 {
    5
}

/// Novelty classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoveltyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Candidate fetch limit; the classifier retrieves up to 2x this
    #[serde(default = "default_novelty_limit")]
    pub limit: usize,
}

impl Default for NoveltyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: default_novelty_limit(),
        }
    }
}

fn default_novelty_limit() -> usize {
    5
}

/// Hybrid retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Per-leg timeout in milliseconds
    #[serde(default = "default_leg_timeout")]
    pub leg_timeout_ms: u64,
    /// Activation decay applied per hop during spreading activation
    #[serde(default = "default_hop_decay")]
    pub spreading_hop_decay: f32,
    /// Maximum hops for the spreading-activation walk
    #[serde(default = "default_max_hops")]
    pub spreading_max_hops: usize,
    /// Result cache TTL in seconds
    #[serde(default = "default_result_cache_ttl")]
    pub result_cache_ttl_seconds: u64,
    /// Result cache capacity
    #[serde(default = "default_result_cache_entries")]
    pub result_cache_max_entries: usize,
    /// Route queries through the LLM analysis path when a completion
    /// provider is configured
    #[serde(default)]
    pub use_llm_routing: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            leg_timeout_ms: default_leg_timeout(),
            spreading_hop_decay: default_hop_decay(),
            spreading_max_hops: default_max_hops(),
            result_cache_ttl_seconds: default_result_cache_ttl(),
            result_cache_max_entries: default_result_cache_entries(),
            use_llm_routing: false,
        }
    }
}

fn default_leg_timeout() -> u64 {
    10_000
}

fn default_hop_decay() -> f32 {
    0.5
}

fn default_max_hops() -> usize {
    2
}

fn default_result_cache_ttl() -> u64 {
    300
}

fn default_result_cache_entries() -> usize {
    1000
}

/// Per-provider circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens
    #[serde(default = "default_breaker_failures")]
    pub failure_threshold: u32,
    /// Window in which failures must accumulate
    #[serde(default = "default_breaker_window")]
    pub window_seconds: u64,
    /// How long the breaker stays open
    #[serde(default = "default_breaker_cooldown")]
    pub cooldown_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_failures(),
            window_seconds: default_breaker_window(),
            cooldown_seconds: default_breaker_cooldown(),
        }
    }
}

fn default_breaker_failures() -> u32 {
    5
}

fn default_breaker_window() -> u64 {
    60
}

fn default_breaker_cooldown() -> u64 {
    30
}

fn default_true() -> bool {
    true
}
