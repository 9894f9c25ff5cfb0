#![deny(missing_docs)]

//! Core library for the docquery PDF question-answering service.

/// HTTP routing, authentication middleware, and REST handlers.
pub mod api;
/// Bearer token verification against the issuer's signing keys.
pub mod auth;
/// Chat model client abstraction and adapters.
pub mod chat;
/// Environment-driven configuration management.
pub mod config;
/// Retrieval-grounded question answering over a tenant's documents.
pub mod conversation;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// PDF text extraction.
pub mod extract;
/// Mapping of verified identities onto tenants.
pub mod identity;
/// Vector index abstraction shared by ingestion and retrieval.
pub mod index;
/// Structured logging and tracing setup.
pub mod logging;
/// Ingestion and chat counters.
pub mod metrics;
/// Chunking and the document ingestion pipeline.
pub mod processing;
/// Qdrant vector store integration.
pub mod qdrant;
/// Ingestion job queue.
pub mod queue;
/// Object storage for uploaded PDFs.
pub mod storage;
/// Relational persistence for tenants, documents, conversations, and messages.
pub mod store;
/// Shared HTTP plumbing for model providers.
pub mod upstream;
/// Bounded-concurrency ingestion worker loop.
pub mod worker;
