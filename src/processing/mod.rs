//! Document ingestion: chunking, embedding, and vector index writes.

pub mod chunking;
pub mod pipeline;
pub mod types;

pub use chunking::chunk_text;
pub use pipeline::IngestionPipeline;
pub use types::{ChunkingError, IngestError, IngestOutcome};
