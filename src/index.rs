//! In-memory vector index for one ingested document.
//!
//! Brute-force cosine similarity over every stored chunk vector. A PDF
//! yields at most a few thousand chunks, so a linear scan per question is
//! fine.

use crate::embedding::cosine_similarity;
use crate::models::Chunk;

/// A chunk together with its embedding.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// A retrieval hit.
#[derive(Debug, Clone)]
pub struct ScoredChunk<'a> {
    pub chunk: &'a Chunk,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    name: String,
    entries: Vec<IndexedChunk>,
}

impl VectorIndex {
    /// Build an index from parallel `chunks` / `vectors`.
    pub fn build(
        name: impl Into<String>,
        chunks: Vec<Chunk>,
        vectors: Vec<Vec<f32>>,
    ) -> anyhow::Result<Self> {
        if chunks.len() != vectors.len() {
            anyhow::bail!(
                "chunk/vector count mismatch: {} chunks, {} vectors",
                chunks.len(),
                vectors.len()
            );
        }
        let entries = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexedChunk { chunk, vector })
            .collect();

        Ok(Self {
            name: name.into(),
            entries,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Up to `k` chunks most similar to `query`, best first. Ties keep
    /// document order.
    pub fn top_k(&self, query: &[f32], k: usize) -> Vec<ScoredChunk<'_>> {
        let mut scored: Vec<ScoredChunk<'_>> = self
            .entries
            .iter()
            .map(|e| ScoredChunk {
                chunk: &e.chunk,
                score: cosine_similarity(query, &e.vector),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk.index.cmp(&b.chunk.index))
        });
        scored.truncate(k);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_text;

    fn three_chunk_index() -> VectorIndex {
        let chunks = chunk_text("alpha\n\nbeta\n\ngamma", 2);
        assert_eq!(chunks.len(), 3);
        VectorIndex::build(
            "IndexName_1",
            chunks,
            vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.7, 0.7]],
        )
        .unwrap()
    }

    #[test]
    fn test_top_k_orders_by_similarity() {
        let index = three_chunk_index();
        let hits = index.top_k(&[0.0, 1.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.text, "beta");
        assert_eq!(hits[1].chunk.text, "gamma");
    }

    #[test]
    fn test_top_k_larger_than_index() {
        let index = three_chunk_index();
        assert_eq!(index.top_k(&[1.0, 0.0], 10).len(), 3);
    }

    #[test]
    fn test_build_rejects_mismatched_lengths() {
        let chunks = chunk_text("alpha", 100);
        assert!(VectorIndex::build("x", chunks, vec![]).is_err());
    }
}
