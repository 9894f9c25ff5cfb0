use anyhow::{Context, Result};
use docquery::{
    api::{self, ApiLimits, AppState},
    auth::TokenVerifier,
    chat,
    config::{self, Config},
    conversation::ConversationEngine,
    embedding,
    identity::IdentityResolver,
    index::VectorIndex,
    logging,
    metrics::CodeMetrics,
    qdrant::QdrantService,
    queue::PgJobQueue,
    storage,
    store::PgStore,
};
use std::{net::Ipv4Addr, sync::Arc};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    config::init_config().context("Failed to load configuration")?;
    logging::init_tracing("server");
    let config = config::get_config();

    let app = api::create_router(build_state(config).await?);

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.server_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.server_port))?;
    tracing::info!("Listening on http://0.0.0.0:{}", config.server_port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn build_state(config: &Config) -> Result<AppState> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    store.migrate().await.context("Failed to apply migrations")?;
    let queue = PgJobQueue::new(
        store.pool().clone(),
        config.worker.max_attempts,
        config.worker.lease,
    );
    let store = Arc::new(store);

    let index = QdrantService::new(
        &config.qdrant_url,
        config.qdrant_api_key.clone(),
        config.qdrant_collection_name.clone(),
        config.embedding.dimension,
    )
    .context("Failed to build Qdrant client")?;
    index.ensure_ready().await.context("Failed to prepare Qdrant collection")?;

    let embedder = embedding::from_settings(&config.embedding)
        .context("Failed to build embedding client")?;
    let chat = chat::from_settings(&config.chat).context("Failed to build chat client")?;
    let blobs = storage::from_settings(&config.storage).context("Failed to build blob store")?;
    let verifier = TokenVerifier::from_settings(&config.auth)
        .context("Failed to build token verifier")?;
    let metrics = Arc::new(CodeMetrics::new());

    let engine = ConversationEngine::new(
        store.clone(),
        embedder,
        Arc::new(index),
        chat,
        metrics.clone(),
        config.retrieval_top_k,
    );

    Ok(AppState {
        verifier: Arc::new(verifier),
        identities: Arc::new(IdentityResolver::new(store.clone())),
        store,
        blobs,
        queue: Arc::new(queue),
        engine: Arc::new(engine),
        metrics,
        limits: ApiLimits {
            upload_max_bytes: config.upload_max_bytes,
            documents_page_size: config.documents_page_size,
        },
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
