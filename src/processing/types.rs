//! Core data types and error definitions for the ingestion pipeline.

use crate::{index::IndexError, storage::StorageError};
use thiserror::Error;

/// Errors produced while splitting text into chunks.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Ingestion configured an impossible window.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    /// Overlap would never advance the window.
    #[error("chunk overlap {overlap} must be smaller than chunk size {chunk_size}")]
    InvalidOverlap {
        /// Configured overlap.
        overlap: usize,
        /// Configured window size.
        chunk_size: usize,
    },
}

/// Job-fatal ingestion failures. The queue owns the retry.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Blob could not be read.
    #[error("failed to fetch document: {0}")]
    Storage(#[from] StorageError),
    /// Blob exists but holds no bytes.
    #[error("document {0} is empty")]
    EmptyDocument(String),
    /// Chunking settings are invalid.
    #[error("failed to chunk document: {0}")]
    Chunking(#[from] ChunkingError),
    /// Batch upsert into the vector index failed.
    #[error("failed to index chunks: {0}")]
    Index(#[from] IndexError),
}

/// Summary of one processed job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Pages with text.
    pub pages: usize,
    /// Non-empty chunks produced by the splitter.
    pub chunks: usize,
    /// Chunks written to the index.
    pub indexed: usize,
    /// Chunks dropped because embedding failed or returned the wrong dimension.
    pub skipped: usize,
}
