//! Telemetry sink seam
//!
//! Background workers and the retrieval path emit `(event, measurements,
//! metadata)` tuples. The default sink logs through `tracing`; tests use
//! the capturing sink.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Event names emitted by the engine
pub mod events {
    pub const ACCESS_TRACKED: &str = "memory.access_tracked";
    pub const CONSOLIDATION_STARTED: &str = "memory.consolidation.started";
    pub const CONSOLIDATION_COMPLETED: &str = "memory.consolidation.completed";
    pub const DECAYED: &str = "memory.decayed";
    pub const FORGETTING_STARTED: &str = "memory.forgetting.started";
    pub const FORGETTING_COMPLETED: &str = "memory.forgetting.completed";
    pub const HYBRID_SEARCH_STARTED: &str = "memory.hybrid_search.started";
    pub const HYBRID_SEARCH_COMPLETED: &str = "memory.hybrid_search.completed";
    pub const ROUTING: &str = "memory.routing";
    pub const WORKING_STORED: &str = "working_memory.stored";
    pub const WORKING_RETRIEVED: &str = "working_memory.retrieved";
    pub const WORKING_EVICTED: &str = "working_memory.evicted";
    pub const WORKING_EXPIRED: &str = "working_memory.expired";
    pub const SYNTHESIS_STARTED: &str = "brain.synthesis.started";
    pub const SYNTHESIS_COMPLETED: &str = "brain.synthesis.completed";
    pub const INTERACTION_CONSOLIDATION_STARTED: &str = "brain.interaction_consolidation.started";
    pub const INTERACTION_CONSOLIDATION_COMPLETED: &str =
        "brain.interaction_consolidation.completed";
}

/// Sink for engine telemetry events
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &str, measurements: &HashMap<String, f64>, metadata: &serde_json::Value);
}

/// Default sink: structured logs via `tracing`
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: &str, measurements: &HashMap<String, f64>, metadata: &serde_json::Value) {
        tracing::info!(
            target: "limbic::telemetry",
            event,
            measurements = ?measurements,
            metadata = %metadata,
        );
    }
}

/// One captured telemetry event
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub event: String,
    pub measurements: HashMap<String, f64>,
    pub metadata: serde_json::Value,
}

/// Capturing sink for tests
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<CapturedEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| e.event == event).count()
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, event: &str, measurements: &HashMap<String, f64>, metadata: &serde_json::Value) {
        self.events.lock().push(CapturedEvent {
            event: event.to_string(),
            measurements: measurements.clone(),
            metadata: metadata.clone(),
        });
    }
}

/// Shorthand for an empty measurements map
pub fn no_measurements() -> HashMap<String, f64> {
    HashMap::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_captures() {
        let sink = MemorySink::new();
        let mut measurements = HashMap::new();
        measurements.insert("count".to_string(), 3.0);

        sink.emit(events::DECAYED, &measurements, &serde_json::json!({"id": 7}));

        assert_eq!(sink.count(events::DECAYED), 1);
        let captured = sink.events();
        assert_eq!(captured[0].measurements.get("count"), Some(&3.0));
    }
}
