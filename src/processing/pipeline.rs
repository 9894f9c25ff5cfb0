//! Ingestion pipeline: blob to tagged, embedded chunks in the vector index.

use crate::{
    embedding::EmbeddingClient,
    extract::extract_pages,
    index::{ChunkTags, IndexedChunk, VectorIndex},
    metrics::CodeMetrics,
    processing::{
        chunking::chunk_text,
        types::{IngestError, IngestOutcome},
    },
    queue::IngestJob,
    storage::BlobStore,
};
use std::sync::Arc;

/// A chunk cut from one page, tagged before embedding.
struct TaggedChunk {
    text: String,
    tags: ChunkTags,
}

/// Turns one ingestion job into indexed chunks.
///
/// Chunks are embedded one at a time so a provider failure only drops the affected chunk; the
/// skip count is logged and added to the metrics. The surviving chunks are written in one batch
/// whose failure fails the job. A document without extractable text completes with zero chunks.
pub struct IngestionPipeline {
    blobs: Arc<dyn BlobStore>,
    embedder: Arc<dyn EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
    metrics: Arc<CodeMetrics>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl IngestionPipeline {
    /// Assemble a pipeline from its collaborators.
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
        metrics: Arc<CodeMetrics>,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Self {
        Self {
            blobs,
            embedder,
            index,
            metrics,
            chunk_size,
            chunk_overlap,
        }
    }

    /// Process one job.
    pub async fn process(&self, job: &IngestJob) -> Result<IngestOutcome, IngestError> {
        tracing::info!(
            tenant_id = job.tenant_id,
            document_id = %job.document_id,
            size = job.size,
            "Processing document"
        );

        let bytes = self.blobs.get(&job.locator).await?;
        if bytes.is_empty() {
            return Err(IngestError::EmptyDocument(job.document_id.clone()));
        }

        let pages = extract_pages(bytes).await;
        let mut outcome = IngestOutcome {
            pages: pages.len(),
            ..IngestOutcome::default()
        };

        let mut tagged = Vec::new();
        for page in &pages {
            let chunks = chunk_text(&page.text, self.chunk_size, self.chunk_overlap)?;
            tagged.extend(chunks.into_iter().enumerate().map(|(position, text)| TaggedChunk {
                text,
                tags: ChunkTags {
                    tenant_id: job.tenant_id,
                    document_id: job.document_id.clone(),
                    original_name: Some(job.original_name.clone()),
                    size: Some(job.size),
                    page: page.number,
                    chunk_index: position as u32,
                },
            }));
        }
        outcome.chunks = tagged.len();

        if tagged.is_empty() {
            tracing::warn!(
                tenant_id = job.tenant_id,
                document_id = %job.document_id,
                "No text content to index"
            );
            self.metrics.record_document(0, 0);
            return Ok(outcome);
        }

        let expected = self.embedder.dimension();
        let mut points = Vec::with_capacity(tagged.len());
        for chunk in tagged {
            match self.embedder.embed(&chunk.text).await {
                Ok(vector) if vector.len() == expected => {
                    points.push(IndexedChunk::new(chunk.text, vector, chunk.tags));
                }
                Ok(vector) => {
                    outcome.skipped += 1;
                    tracing::warn!(
                        document_id = %job.document_id,
                        page = chunk.tags.page,
                        chunk_index = chunk.tags.chunk_index,
                        expected,
                        actual = vector.len(),
                        "Embedding skipped: dimension mismatch"
                    );
                }
                Err(err) => {
                    outcome.skipped += 1;
                    tracing::warn!(
                        document_id = %job.document_id,
                        page = chunk.tags.page,
                        chunk_index = chunk.tags.chunk_index,
                        error = %err,
                        "Embedding skipped"
                    );
                }
            }
        }

        if points.is_empty() {
            tracing::warn!(
                tenant_id = job.tenant_id,
                document_id = %job.document_id,
                skipped = outcome.skipped,
                "No valid embeddings to index"
            );
            self.metrics.record_document(0, outcome.skipped as u64);
            return Ok(outcome);
        }

        outcome.indexed = self.index.upsert(points).await?;
        self.metrics
            .record_document(outcome.indexed as u64, outcome.skipped as u64);

        tracing::info!(
            tenant_id = job.tenant_id,
            document_id = %job.document_id,
            pages = outcome.pages,
            chunks = outcome.chunks,
            indexed = outcome.indexed,
            skipped = outcome.skipped,
            "Document indexed"
        );
        Ok(outcome)
    }
}
