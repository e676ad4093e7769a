use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::services::providers::{RetrievalProvider, RetrievedChunk};
use crate::utils::error::BackendError;
use crate::utils::similarity::cosine_similarity;

/// A pre-embedded chunk as written by the ingestion pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexedChunk {
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub embedding: Vec<f32>,
}

/// Brute-force cosine index over an immutable set of chunks.
#[derive(Debug, Default)]
pub struct VectorIndex {
    chunks: Vec<IndexedChunk>,
    dimension: usize,
}

impl VectorIndex {
    /// Keeps only chunks whose embedding has the expected dimension.
    pub fn from_chunks(chunks: Vec<IndexedChunk>, dimension: usize) -> Self {
        let total = chunks.len();
        let chunks: Vec<_> = chunks
            .into_iter()
            .filter(|c| c.embedding.len() == dimension)
            .collect();

        if chunks.len() < total {
            warn!(
                "Skipped {} chunks with embedding dimension != {}",
                total - chunks.len(),
                dimension
            );
        }

        Self { chunks, dimension }
    }

    /// Loads a JSON array of chunks. A missing file yields an empty index.
    pub async fn load(path: impl AsRef<Path>, dimension: usize) -> Result<Self> {
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            warn!(
                "Knowledge index {} not found, answers will have no retrieved context",
                path.display()
            );
            return Ok(Self::from_chunks(Vec::new(), dimension));
        }

        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read knowledge index {}", path.display()))?;
        let chunks: Vec<IndexedChunk> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse knowledge index {}", path.display()))?;

        let index = Self::from_chunks(chunks, dimension);
        info!("Loaded {} chunks from {}", index.len(), path.display());
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Top `k` chunks by cosine similarity, best first.
    pub fn top_k(&self, vector: &[f32], k: usize) -> Result<Vec<RetrievedChunk>> {
        if vector.len() != self.dimension {
            anyhow::bail!(
                "Query dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            );
        }

        let mut scored = Vec::with_capacity(self.chunks.len());
        for chunk in &self.chunks {
            scored.push((cosine_similarity(vector, &chunk.embedding)?, chunk));
        }
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, chunk)| RetrievedChunk {
                text: chunk.text.clone(),
                metadata: chunk.metadata.clone(),
                score,
            })
            .collect())
    }
}

#[async_trait]
impl RetrievalProvider for VectorIndex {
    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<RetrievedChunk>, BackendError> {
        self.top_k(vector, k)
            .map_err(|e| BackendError::unavailable("retrieval", format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, embedding: Vec<f32>) -> IndexedChunk {
        IndexedChunk {
            text: text.to_string(),
            metadata: HashMap::new(),
            embedding,
        }
    }

    fn index() -> VectorIndex {
        VectorIndex::from_chunks(
            vec![
                chunk("rust", vec![1.0, 0.0]),
                chunk("python", vec![0.0, 1.0]),
                chunk("both", vec![0.7, 0.7]),
                chunk("broken", vec![1.0, 0.0, 0.0]),
            ],
            2,
        )
    }

    #[test]
    fn test_drops_wrong_dimension() {
        assert_eq!(index().len(), 3);
    }

    #[test]
    fn test_ranks_by_similarity() {
        let hits = index().top_k(&[1.0, 0.1], 2).unwrap();
        let texts: Vec<_> = hits.iter().map(|h| h.text.as_str()).collect();
        assert_eq!(texts, vec!["rust", "both"]);
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_search_reports_backend_error() {
        let err = index().search(&[1.0, 0.0, 0.0], 3).await.unwrap_err();
        assert_eq!(err.op(), "retrieval");
    }

    #[tokio::test]
    async fn test_missing_file_gives_empty_index() {
        let index = VectorIndex::load("does/not/exist.json", 384).await.unwrap();
        assert!(index.is_empty());
    }
}
