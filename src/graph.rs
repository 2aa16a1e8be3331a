//! Knowledge-graph seam
//!
//! The graph back end is an external collaborator; the engine only sees
//! this trait. The retriever uses `query_related` for the graph leg,
//! `neighbors` for the spreading-activation walk, and
//! `count_connections` for the connectivity score.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::Result;
use crate::types::EngramId;

/// A knowledge-graph triple
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl Triple {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }

    /// Natural-text rendering used when a triple is synthesised into a
    /// memory-shaped record
    pub fn to_text(&self) -> String {
        format!("{} {} {}", self.subject, self.predicate, self.object)
    }
}

/// External knowledge-graph interface
#[async_trait]
pub trait KnowledgeGraph: Send + Sync {
    /// Triples whose natural text relates to the query
    async fn query_related(&self, text: &str, limit: usize) -> Result<Vec<Triple>>;

    /// Number of graph connections for an engram
    async fn count_connections(&self, engram_id: EngramId) -> Result<u32>;

    /// Weighted engram neighbours, for bounded graph walks
    async fn neighbors(&self, engram_id: EngramId, limit: usize) -> Result<Vec<(EngramId, f32)>> {
        let _ = (engram_id, limit);
        Ok(vec![])
    }
}

/// No-op graph: every query returns nothing
pub struct NullGraph;

#[async_trait]
impl KnowledgeGraph for NullGraph {
    async fn query_related(&self, _text: &str, _limit: usize) -> Result<Vec<Triple>> {
        Ok(vec![])
    }

    async fn count_connections(&self, _engram_id: EngramId) -> Result<u32> {
        Ok(0)
    }
}

/// In-memory graph for tests and single-process setups
#[derive(Default)]
pub struct InMemoryGraph {
    triples: RwLock<Vec<Triple>>,
    edges: RwLock<HashMap<EngramId, Vec<(EngramId, f32)>>>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_triple(&self, triple: Triple) {
        self.triples.write().push(triple);
    }

    /// Add a bidirectional weighted edge between two engrams
    pub fn add_edge(&self, a: EngramId, b: EngramId, weight: f32) {
        let mut edges = self.edges.write();
        edges.entry(a).or_default().push((b, weight));
        edges.entry(b).or_default().push((a, weight));
    }
}

#[async_trait]
impl KnowledgeGraph for InMemoryGraph {
    async fn query_related(&self, text: &str, limit: usize) -> Result<Vec<Triple>> {
        let terms: Vec<String> = text
            .to_lowercase()
            .split_whitespace()
            .map(String::from)
            .collect();
        let triples = self.triples.read();
        Ok(triples
            .iter()
            .filter(|t| {
                let rendered = t.to_text().to_lowercase();
                terms.iter().any(|term| rendered.contains(term))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_connections(&self, engram_id: EngramId) -> Result<u32> {
        Ok(self
            .edges
            .read()
            .get(&engram_id)
            .map(|e| e.len() as u32)
            .unwrap_or(0))
    }

    async fn neighbors(&self, engram_id: EngramId, limit: usize) -> Result<Vec<(EngramId, f32)>> {
        Ok(self
            .edges
            .read()
            .get(&engram_id)
            .map(|e| e.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_graph_query() {
        let graph = InMemoryGraph::new();
        graph.add_triple(Triple::new("auth service", "uses", "jwt tokens"));
        graph.add_triple(Triple::new("cache", "backs", "session store"));

        let hits = graph.query_related("what is auth", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].subject, "auth service");
    }

    #[tokio::test]
    async fn test_in_memory_graph_edges() {
        let graph = InMemoryGraph::new();
        graph.add_edge(1, 2, 0.9);
        graph.add_edge(1, 3, 0.5);

        assert_eq!(graph.count_connections(1).await.unwrap(), 2);
        assert_eq!(graph.count_connections(2).await.unwrap(), 1);
        assert_eq!(graph.neighbors(1, 10).await.unwrap().len(), 2);
        assert!(graph.neighbors(99, 10).await.unwrap().is_empty());
    }
}
