//! Limbic - persistent associative memory for AI agents
//!
//! Ingests short textual engrams, scores them for long-term relevance
//! with active-day decay, retrieves them by hybrid
//! semantic+lexical+graph+temporal ranking, and consolidates or forgets
//! them over time.

pub mod access;
pub mod activity;
pub mod attention;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod graph;
pub mod lifecycle;
pub mod llm;
pub mod novelty;
pub mod retrieval;
pub mod scoring;
pub mod storage;
pub mod telemetry;
pub mod types;
pub mod working;
pub mod writer;

pub use engine::{AdmissionOutcome, EngineStats, MemoryEngine};
pub use error::{LimbicError, Result};
pub use storage::EngramStore;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
