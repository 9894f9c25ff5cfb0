//! Vector index abstraction shared by ingestion and retrieval.
//!
//! Every chunk carries the same flat tag set, and every query is scoped by tenant and document,
//! so one tenant's chunks never answer another tenant's question.

use crate::qdrant::QdrantError;
use crate::store::TenantId;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Errors raised by vector index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Qdrant call failed.
    #[error(transparent)]
    Qdrant(#[from] QdrantError),
    /// A vector does not match the collection dimension.
    #[error("vector has {actual} dimensions, index expects {expected}")]
    DimensionMismatch {
        /// Collection dimension.
        expected: usize,
        /// Offending vector length.
        actual: usize,
    },
}

/// Identity and provenance tags stored with every chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkTags {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Source document.
    pub document_id: String,
    /// Filename supplied at upload.
    pub original_name: Option<String>,
    /// Document size in bytes.
    pub size: Option<i64>,
    /// 1-based page the chunk was cut from.
    pub page: u32,
    /// Position of the chunk within its page.
    pub chunk_index: u32,
}

/// A chunk ready to be written to the index.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    /// Stable point id; see [`point_id`].
    pub id: Uuid,
    /// Chunk text.
    pub text: String,
    /// Embedding of `text`.
    pub vector: Vec<f32>,
    /// Tags used for scoping.
    pub tags: ChunkTags,
}

impl IndexedChunk {
    /// Build a chunk whose id is derived from its tags.
    pub fn new(text: String, vector: Vec<f32>, tags: ChunkTags) -> Self {
        Self {
            id: point_id(&tags),
            text,
            vector,
            tags,
        }
    }
}

/// Deterministic point id for a chunk position, so a redelivered job overwrites its own points.
pub fn point_id(tags: &ChunkTags) -> Uuid {
    let name = format!(
        "{}:{}:{}:{}",
        tags.tenant_id, tags.document_id, tags.page, tags.chunk_index
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

/// Retrieval scope: both fields must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkScope {
    /// Tenant asking the question.
    pub tenant_id: TenantId,
    /// Document the conversation is about.
    pub document_id: String,
}

/// A retrieved chunk.
#[derive(Debug, Clone)]
pub struct ChunkHit {
    /// Chunk text.
    pub text: String,
    /// Similarity score, higher is closer.
    pub score: f32,
    /// Stored tags.
    pub tags: ChunkTags,
}

/// Vector index used by the ingestion pipeline and the conversation engine.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection and payload indexes when missing.
    async fn ensure_ready(&self) -> Result<(), IndexError>;

    /// Insert or overwrite chunks by id.
    async fn upsert(&self, chunks: Vec<IndexedChunk>) -> Result<usize, IndexError>;

    /// Return up to `limit` chunks inside `scope`, nearest first.
    async fn query(
        &self,
        vector: &[f32],
        scope: &ChunkScope,
        limit: usize,
    ) -> Result<Vec<ChunkHit>, IndexError>;
}

/// Brute-force cosine index held in memory.
pub struct InMemoryIndex {
    dimension: usize,
    points: RwLock<HashMap<Uuid, IndexedChunk>>,
}

impl InMemoryIndex {
    /// Create an empty index for vectors of `dimension` entries.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            points: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored points.
    pub async fn len(&self) -> usize {
        self.points.read().await.len()
    }

    /// Whether the index holds no points.
    pub async fn is_empty(&self) -> bool {
        self.points.read().await.is_empty()
    }

    /// Number of points tagged with `document_id`.
    pub async fn count_for_document(&self, document_id: &str) -> usize {
        self.points
            .read()
            .await
            .values()
            .filter(|chunk| chunk.tags.document_id == document_id)
            .count()
    }
}

fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn ensure_ready(&self) -> Result<(), IndexError> {
        Ok(())
    }

    async fn upsert(&self, chunks: Vec<IndexedChunk>) -> Result<usize, IndexError> {
        if let Some(chunk) = chunks.iter().find(|chunk| chunk.vector.len() != self.dimension) {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: chunk.vector.len(),
            });
        }
        let count = chunks.len();
        let mut points = self.points.write().await;
        for chunk in chunks {
            points.insert(chunk.id, chunk);
        }
        Ok(count)
    }

    async fn query(
        &self,
        vector: &[f32],
        scope: &ChunkScope,
        limit: usize,
    ) -> Result<Vec<ChunkHit>, IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let points = self.points.read().await;
        let mut hits: Vec<ChunkHit> = points
            .values()
            .filter(|chunk| {
                chunk.tags.tenant_id == scope.tenant_id
                    && chunk.tags.document_id == scope.document_id
            })
            .map(|chunk| ChunkHit {
                text: chunk.text.clone(),
                score: cosine_sim(vector, &chunk.vector),
                tags: chunk.tags.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }
}
