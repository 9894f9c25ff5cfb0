use serde::{Deserialize, Serialize};
use std::env;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration shared by the HTTP server and the ingestion worker.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string for the relational store and job queue.
    pub database_url: String,
    /// Port the HTTP server listens on.
    pub server_port: u16,
    /// Bearer token verification settings.
    pub auth: AuthSettings,
    /// Base URL of the Qdrant instance that stores chunk embeddings.
    pub qdrant_url: String,
    /// Name of the Qdrant collection holding every tenant's chunks.
    pub qdrant_collection_name: String,
    /// Optional API key required to access Qdrant.
    pub qdrant_api_key: Option<String>,
    /// Embedding backend settings.
    pub embedding: EmbeddingSettings,
    /// Chat model backend settings.
    pub chat: ChatSettings,
    /// Object storage settings for uploaded PDFs.
    pub storage: StorageSettings,
    /// Largest accepted upload, in bytes.
    pub upload_max_bytes: usize,
    /// Page size for `GET /documents`.
    pub documents_page_size: i64,
    /// Splitter window, in characters.
    pub chunk_size: usize,
    /// Characters shared by consecutive chunks.
    pub chunk_overlap: usize,
    /// Number of chunks retrieved per question.
    pub retrieval_top_k: usize,
    /// Queue consumer settings.
    pub worker: WorkerSettings,
}

/// Settings for the bearer token verifier.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// Issuer every accepted token must carry in `iss`.
    pub issuer: String,
    /// Endpoint publishing the issuer's signing keys.
    pub jwks_url: String,
    /// Audience required in `aud` when configured.
    pub audience: Option<String>,
    /// Authorized party required in `azp` when configured.
    pub authorized_party: Option<String>,
    /// How long a fetched key set is served before refreshing.
    pub jwks_cache_ttl: Duration,
}

/// Supported embedding backends.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Google Generative Language embeddings.
    Gemini,
    /// Hosted OpenAI embeddings API.
    OpenAI,
    /// Deterministic in-process hashing embedder (offline development).
    Local,
}

/// Embedding backend settings.
#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    /// Selected backend.
    pub provider: EmbeddingProvider,
    /// Model identifier passed to the backend.
    pub model: String,
    /// Dimensionality of produced vectors.
    pub dimension: usize,
    /// Credential for the selected backend, when it needs one.
    pub api_key: Option<String>,
}

/// Supported chat model backends.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatProvider {
    /// Google Gemini `generateContent`.
    Gemini,
    /// OpenAI chat completions.
    #[serde(rename = "openai")]
    OpenAI,
    /// Llama 3 behind an OpenAI-compatible endpoint.
    Llama3,
    /// Hugging Face router (OpenAI-compatible).
    HfRouter,
}

/// Chat model backend settings.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    /// Selected backend.
    pub provider: ChatProvider,
    /// Model identifier passed to the backend.
    pub model: String,
    /// Credential for the selected backend.
    pub api_key: Option<String>,
    /// Base URL override for OpenAI-compatible backends.
    pub base_url: Option<String>,
}

/// Where uploaded blobs are written.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageProviderKind {
    /// Local filesystem under `UPLOAD_DIR`.
    Local,
    /// Amazon S3 or an S3-compatible service.
    S3,
}

impl StorageProviderKind {
    /// Name persisted in `document_upload.storage_provider`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::S3 => "s3",
        }
    }
}

/// Object storage settings.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Selected backend.
    pub provider: StorageProviderKind,
    /// Root directory for the local backend.
    pub upload_dir: String,
    /// Bucket for the S3 backend.
    pub s3_bucket: Option<String>,
    /// Region for the S3 backend.
    pub s3_region: Option<String>,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    pub s3_endpoint: Option<String>,
}

/// Queue consumer settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Maximum number of jobs processed concurrently.
    pub concurrency: usize,
    /// Delivery attempts before a job is marked failed.
    pub max_attempts: i32,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Lease on a claimed job; an expired lease makes the job claimable again.
    pub lease: Duration,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let issuer = load_env("AUTH_ISSUER")?.trim_end_matches('/').to_string();
        let jwks_url = load_env_optional("AUTH_JWKS_URL")
            .unwrap_or_else(|| format!("{issuer}/.well-known/jwks.json"));

        let llm_provider: ChatProvider = load_env_optional("LLM_PROVIDER")
            .unwrap_or_else(|| "gemini".into())
            .parse()
            .map_err(|()| ConfigError::InvalidValue("LLM_PROVIDER".into()))?;
        let default_embedding = match llm_provider {
            ChatProvider::OpenAI => "openai",
            _ => "gemini",
        };
        let embedding_provider: EmbeddingProvider = load_env_optional("EMBEDDING_PROVIDER")
            .unwrap_or_else(|| default_embedding.into())
            .parse()
            .map_err(|()| ConfigError::InvalidValue("EMBEDDING_PROVIDER".into()))?;

        let embedding = EmbeddingSettings {
            provider: embedding_provider,
            model: load_env_optional("EMBEDDING_MODEL")
                .unwrap_or_else(|| default_embedding_model(embedding_provider).into()),
            dimension: parse_env("EMBEDDING_DIMENSION", 768)?,
            api_key: match embedding_provider {
                EmbeddingProvider::Gemini => Some(load_env("GOOGLE_API_KEY")?),
                EmbeddingProvider::OpenAI => Some(load_env("OPENAI_API_KEY")?),
                EmbeddingProvider::Local => None,
            },
        };
        if embedding.dimension == 0 {
            return Err(ConfigError::InvalidValue("EMBEDDING_DIMENSION".into()));
        }

        let chat = ChatSettings {
            provider: llm_provider,
            model: load_env_optional("CHAT_MODEL")
                .unwrap_or_else(|| default_chat_model(llm_provider).into()),
            api_key: Some(match llm_provider {
                ChatProvider::Gemini => load_env("GOOGLE_API_KEY")?,
                ChatProvider::OpenAI => load_env("OPENAI_API_KEY")?,
                ChatProvider::Llama3 => load_env("LLAMA_API_KEY")?,
                ChatProvider::HfRouter => load_env("HF_TOKEN")?,
            }),
            base_url: match llm_provider {
                ChatProvider::Llama3 => Some(load_env("LLAMA_BASE_URL")?),
                ChatProvider::HfRouter => Some(
                    load_env_optional("HF_BASE_URL")
                        .unwrap_or_else(|| "https://router.huggingface.co/v1".into()),
                ),
                _ => None,
            },
        };

        let storage_provider: StorageProviderKind = load_env_optional("STORAGE_PROVIDER")
            .unwrap_or_else(|| "local".into())
            .parse()
            .map_err(|()| ConfigError::InvalidValue("STORAGE_PROVIDER".into()))?;
        let storage = StorageSettings {
            provider: storage_provider,
            upload_dir: load_env_optional("UPLOAD_DIR").unwrap_or_else(|| "uploads".into()),
            s3_bucket: match storage_provider {
                StorageProviderKind::S3 => Some(load_env("S3_BUCKET_NAME")?),
                StorageProviderKind::Local => load_env_optional("S3_BUCKET_NAME"),
            },
            s3_region: match storage_provider {
                StorageProviderKind::S3 => Some(load_env("AWS_REGION")?),
                StorageProviderKind::Local => load_env_optional("AWS_REGION"),
            },
            s3_endpoint: load_env_optional("S3_ENDPOINT_URL"),
        };

        let chunk_size: usize = parse_env("CHUNK_SIZE", 1000)?;
        let chunk_overlap: usize = parse_env("CHUNK_OVERLAP", 200)?;
        if chunk_size == 0 {
            return Err(ConfigError::InvalidValue("CHUNK_SIZE".into()));
        }
        if chunk_overlap >= chunk_size {
            return Err(ConfigError::InvalidValue("CHUNK_OVERLAP".into()));
        }

        Ok(Self {
            database_url: load_env("DATABASE_URL")?,
            server_port: parse_env("SERVER_PORT", 8000)?,
            auth: AuthSettings {
                issuer,
                jwks_url,
                audience: load_env_optional("AUTH_AUDIENCE"),
                authorized_party: load_env_optional("AUTH_AUTHORIZED_PARTY"),
                jwks_cache_ttl: Duration::from_secs(parse_env("JWKS_CACHE_TTL_SECS", 600)?),
            },
            qdrant_url: load_env_optional("QDRANT_URL")
                .unwrap_or_else(|| "http://localhost:6333".into()),
            qdrant_collection_name: load_env_optional("QDRANT_COLLECTION_NAME")
                .unwrap_or_else(|| "pdf-embeddings-768".into()),
            qdrant_api_key: load_env_optional("QDRANT_API_KEY"),
            embedding,
            chat,
            storage,
            upload_max_bytes: parse_env("UPLOAD_MAX_BYTES", 10 * 1024 * 1024)?,
            documents_page_size: parse_env("DOCUMENTS_PAGE_SIZE", 50)?,
            chunk_size,
            chunk_overlap,
            retrieval_top_k: parse_env::<usize>("RETRIEVAL_TOP_K", 2)?.max(1),
            worker: WorkerSettings {
                concurrency: parse_env::<usize>("WORKER_CONCURRENCY", 16)?.max(1),
                max_attempts: parse_env::<i32>("JOB_MAX_ATTEMPTS", 3)?.max(1),
                poll_interval: Duration::from_millis(parse_env("JOB_POLL_INTERVAL_MS", 500)?),
                lease: Duration::from_secs(parse_env("JOB_LEASE_SECS", 300)?),
            },
        })
    }
}

fn default_embedding_model(provider: EmbeddingProvider) -> &'static str {
    match provider {
        EmbeddingProvider::OpenAI => "text-embedding-3-small",
        EmbeddingProvider::Gemini => "text-embedding-004",
        EmbeddingProvider::Local => "local-hash",
    }
}

fn default_chat_model(provider: ChatProvider) -> &'static str {
    match provider {
        ChatProvider::OpenAI => "gpt-4o-mini",
        ChatProvider::Llama3 => "meta-llama/llama-3.1-8b-instruct",
        ChatProvider::HfRouter => "MiniMaxAI/MiniMax-M2.5:novita",
        ChatProvider::Gemini => "gemini-2.5-flash",
    }
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    load_env_optional(key).ok_or_else(|| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "openai" => Ok(Self::OpenAI),
            "local" => Ok(Self::Local),
            _ => Err(()),
        }
    }
}

impl std::str::FromStr for ChatProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "openai" => Ok(Self::OpenAI),
            "llama3" => Ok(Self::Llama3),
            "hf_router" => Ok(Self::HfRouter),
            _ => Err(()),
        }
    }
}

impl std::str::FromStr for StorageProviderKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() -> Result<(), ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        qdrant_url = %config.qdrant_url,
        collection = %config.qdrant_collection_name,
        server_port = config.server_port,
        embedding_provider = ?config.embedding.provider,
        llm_provider = ?config.chat.provider,
        storage_provider = ?config.storage.provider,
        "Loaded configuration"
    );
    CONFIG
        .set(config)
        .map_err(|_| ConfigError::InvalidValue("configuration already initialized".into()))
}
