//! HTTP surface for docquery.
//!
//! - `GET /`, `GET /health` – Liveness probe (no credential).
//! - `POST /upload` (alias `POST /upload/pdf`) – Multipart PDF upload (`pdf` field, optional
//!   `documentId`). Stores the blob, records the document, and enqueues ingestion.
//! - `GET /documents` – Caller's documents, newest first.
//! - `GET /conversations`, `POST /conversations` – List or create conversations.
//! - `GET /conversations/{id}/messages` – Ordered messages of an owned conversation.
//! - `POST /chat` – Retrieval-grounded answer about one document.
//! - `GET /metrics` – Chat counters of this server.
//!
//! Every route except the liveness probe and CORS preflight requires a bearer token.

pub mod error;
pub mod handlers;
pub mod middleware;

pub use error::ApiError;

use crate::{
    auth::TokenVerifier, conversation::ConversationEngine, identity::IdentityResolver,
    metrics::CodeMetrics, queue::JobQueue, storage::BlobStore, store::Store,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Multipart framing allowance on top of the file size limit.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Request limits applied by the handlers.
#[derive(Debug, Clone, Copy)]
pub struct ApiLimits {
    /// Largest accepted PDF, in bytes.
    pub upload_max_bytes: usize,
    /// Page size for `GET /documents`.
    pub documents_page_size: i64,
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Bearer token verifier.
    pub verifier: Arc<TokenVerifier>,
    /// Identity to tenant mapping.
    pub identities: Arc<IdentityResolver>,
    /// Relational store.
    pub store: Arc<dyn Store>,
    /// Upload blob storage.
    pub blobs: Arc<dyn BlobStore>,
    /// Ingestion job queue.
    pub queue: Arc<dyn JobQueue>,
    /// Question answering engine.
    pub engine: Arc<ConversationEngine>,
    /// Process counters.
    pub metrics: Arc<CodeMetrics>,
    /// Request limits.
    pub limits: ApiLimits,
}

/// Build the router with authentication, CORS, and request tracing.
pub fn create_router(state: AppState) -> Router {
    let upload_limit = DefaultBodyLimit::max(
        state
            .limits
            .upload_max_bytes
            .saturating_add(MULTIPART_OVERHEAD_BYTES),
    );

    let protected = Router::new()
        .route("/upload", post(handlers::upload).layer(upload_limit))
        .route("/upload/pdf", post(handlers::upload).layer(upload_limit))
        .route("/documents", get(handlers::list_documents))
        .route(
            "/conversations",
            get(handlers::list_conversations).post(handlers::create_conversation),
        )
        .route("/conversations/:id/messages", get(handlers::list_messages))
        .route("/chat", post(handlers::chat))
        .route("/metrics", get(handlers::metrics))
        .route_layer(from_fn_with_state(state.clone(), middleware::require_tenant));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::health))
        .route("/health", get(handlers::health))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
