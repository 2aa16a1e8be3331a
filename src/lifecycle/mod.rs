//! Memory lifecycle workers: consolidation, forgetting, synthesis

pub mod consolidation;
pub mod forgetting;
pub mod synthesis;

pub use consolidation::{
    ConsolidationReport, Consolidator, InteractionConsolidator, InteractionReport,
    InteractionSource, ToolInteraction,
};
pub use forgetting::{ForgettingReport, ForgettingSweeper};
pub use synthesis::{SynthesisReport, Synthesizer, SYNTHESIS_SOURCE};
