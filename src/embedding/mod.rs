//! Embedding backends.
//!
//! Every backend produces vectors of a fixed, configured dimension. Ingestion and retrieval
//! share the same client so stored chunks and questions land in the same vector space.

use crate::config::{EmbeddingProvider, EmbeddingSettings};
use crate::upstream::{self, DEFAULT_MAX_RETRIES, UpstreamError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Errors raised by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingClientError {
    /// Provider was unable to produce embeddings for the supplied input.
    #[error("Failed to generate embeddings: {0}")]
    GenerationFailed(String),
    /// Provider call failed.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// Provider answered with a body we could not interpret.
    #[error("Invalid embedding response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for EmbeddingClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(UpstreamError::Http(err))
    }
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Dimension of produced vectors.
    fn dimension(&self) -> usize;

    /// Produce an embedding vector for each supplied chunk of text, in input order.
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingClientError> {
        self.generate_embeddings(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingClientError::InvalidResponse("empty embedding list".into()))
    }
}

/// Build the embedding client selected by configuration.
pub fn from_settings(
    settings: &EmbeddingSettings,
) -> Result<Arc<dyn EmbeddingClient>, EmbeddingClientError> {
    let api_key = || {
        settings.api_key.clone().ok_or_else(|| {
            EmbeddingClientError::GenerationFailed(format!(
                "{:?} embeddings require an API key",
                settings.provider
            ))
        })
    };
    let client: Arc<dyn EmbeddingClient> = match settings.provider {
        EmbeddingProvider::OpenAI => Arc::new(OpenAiEmbeddingClient::new(
            api_key()?,
            settings.model.clone(),
            settings.dimension,
        )?),
        EmbeddingProvider::Gemini => Arc::new(GeminiEmbeddingClient::new(
            api_key()?,
            settings.model.clone(),
            settings.dimension,
        )?),
        EmbeddingProvider::Local => Arc::new(HashingEmbedder::new(settings.dimension)),
    };
    tracing::info!(
        provider = ?settings.provider,
        model = %settings.model,
        dimension = settings.dimension,
        "Embedding client ready"
    );
    Ok(client)
}

/// OpenAI `POST /embeddings` client.
pub struct OpenAiEmbeddingClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
    max_retries: u32,
}

impl OpenAiEmbeddingClient {
    /// Create a client against the public OpenAI API.
    pub fn new(
        api_key: String,
        model: String,
        dimension: usize,
    ) -> Result<Self, EmbeddingClientError> {
        Ok(Self {
            http: upstream::http_client(Duration::from_secs(30))?,
            base_url: OPENAI_BASE_URL.to_string(),
            api_key,
            model,
            dimension,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Point the client at another OpenAI-compatible endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbeddingClient {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if texts.is_empty() {
            return Err(EmbeddingClientError::GenerationFailed(
                "no texts provided".to_string(),
            ));
        }
        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dimension,
        });
        let response = upstream::send_json(
            || self.http.post(&url).bearer_auth(&self.api_key).json(&body),
            self.max_retries,
        )
        .await?;
        parse_openai_response(&response, texts.len())
    }
}

fn parse_openai_response(
    response: &Value,
    expected: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
    let data = response
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| EmbeddingClientError::InvalidResponse("missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map_or(position, |index| index as usize);
        let vector = item
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| EmbeddingClientError::InvalidResponse("missing embedding".into()))?;
        indexed.push((index, to_vector(vector)));
    }
    indexed.sort_by_key(|(index, _)| *index);

    if indexed.len() != expected {
        return Err(EmbeddingClientError::InvalidResponse(format!(
            "expected {expected} embeddings, got {}",
            indexed.len()
        )));
    }
    Ok(indexed.into_iter().map(|(_, vector)| vector).collect())
}

/// Google Generative Language `batchEmbedContents` client.
pub struct GeminiEmbeddingClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
    max_retries: u32,
}

impl GeminiEmbeddingClient {
    /// Create a client against the public Generative Language API.
    pub fn new(
        api_key: String,
        model: String,
        dimension: usize,
    ) -> Result<Self, EmbeddingClientError> {
        Ok(Self {
            http: upstream::http_client(Duration::from_secs(30))?,
            base_url: GEMINI_BASE_URL.to_string(),
            api_key,
            model: model.trim_start_matches("models/").to_string(),
            dimension,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Point the client at another endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[async_trait]
impl EmbeddingClient for GeminiEmbeddingClient {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if texts.is_empty() {
            return Err(EmbeddingClientError::GenerationFailed(
                "no texts provided".to_string(),
            ));
        }
        let url = format!("{}/models/{}:batchEmbedContents", self.base_url, self.model);
        let requests: Vec<Value> = texts
            .iter()
            .map(|text| {
                json!({
                    "model": format!("models/{}", self.model),
                    "content": { "parts": [{ "text": text }] },
                    "outputDimensionality": self.dimension,
                })
            })
            .collect();
        let body = json!({ "requests": requests });

        let response = upstream::send_json(
            || {
                self.http
                    .post(&url)
                    .header("x-goog-api-key", &self.api_key)
                    .json(&body)
            },
            self.max_retries,
        )
        .await?;

        let embeddings = response
            .get("embeddings")
            .and_then(Value::as_array)
            .ok_or_else(|| EmbeddingClientError::InvalidResponse("missing embeddings".into()))?;
        if embeddings.len() != texts.len() {
            return Err(EmbeddingClientError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        embeddings
            .iter()
            .map(|embedding| {
                embedding
                    .get("values")
                    .and_then(Value::as_array)
                    .map(|values| to_vector(values))
                    .ok_or_else(|| EmbeddingClientError::InvalidResponse("missing values".into()))
            })
            .collect()
    }
}

fn to_vector(values: &[Value]) -> Vec<f32> {
    values
        .iter()
        .map(|value| value.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// Deterministic offline embedder: hashes lowercase word tokens into buckets.
///
/// Texts sharing vocabulary end up close under cosine similarity, which is enough for local
/// development and tests without a provider account.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    /// Construct an embedder producing vectors of `dimension` entries.
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let position = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            embedding[position] += 1.0;
        }

        let norm = embedding
            .iter()
            .map(|value| value * value)
            .sum::<f32>()
            .sqrt();

        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

#[async_trait]
impl EmbeddingClient for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if self.dimension == 0 {
            return Err(EmbeddingClientError::GenerationFailed(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }

        if texts.is_empty() {
            return Err(EmbeddingClientError::GenerationFailed(
                "no texts provided".to_string(),
            ));
        }

        Ok(texts.iter().map(|text| self.encode(text)).collect())
    }
}
