//! Qdrant vector store integration.

pub mod client;
pub mod filters;
pub mod payload;
pub mod types;

pub use client::QdrantService;
pub use filters::scope_filter;
pub use types::{QdrantError, ScoredPoint};
