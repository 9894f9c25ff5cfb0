//! HTTP client wrapper for interacting with Qdrant.

use crate::index::{ChunkHit, ChunkScope, IndexError, IndexedChunk, VectorIndex};
use crate::qdrant::{
    filters::scope_filter,
    payload::{KEYWORD_FIELDS, build_payload, current_timestamp_rfc3339, parse_hit},
    types::{QdrantError, QueryResponse, QueryResponseResult, ScoredPoint},
};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};

/// Lightweight HTTP client for one Qdrant collection.
pub struct QdrantService {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) collection: String,
    pub(crate) dimension: usize,
}

impl QdrantService {
    /// Construct a client for `collection` holding vectors of `dimension` entries.
    pub fn new(
        url: &str,
        api_key: Option<String>,
        collection: impl Into<String>,
        dimension: usize,
    ) -> Result<Self, QdrantError> {
        let client = Client::builder().user_agent("docquery/0.1").build()?;

        let base_url = normalize_base_url(url).map_err(QdrantError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            has_api_key = %api_key
                .as_deref()
                .map(|value| !value.is_empty())
                .unwrap_or(false),
            "Initialized Qdrant HTTP client"
        );

        Ok(Self {
            client,
            base_url,
            api_key,
            collection: collection.into(),
            dimension,
        })
    }

    /// Name of the collection this client writes to.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Create the collection only when it is missing from Qdrant.
    pub async fn create_collection_if_not_exists(&self) -> Result<(), QdrantError> {
        if self.collection_exists().await? {
            return Ok(());
        }

        tracing::info!(
            collection = %self.collection,
            vector_size = self.dimension,
            "Creating collection"
        );
        let body = json!({
            "vectors": {
                "size": self.dimension,
                "distance": "Cosine"
            }
        });

        let response = self
            .request(Method::PUT, &format!("collections/{}", self.collection))
            .json(&body)
            .send()
            .await?;

        self.ensure_success(response, || {
            tracing::debug!(collection = %self.collection, "Collection created");
        })
        .await
    }

    /// Ensure keyword payload indexes exist for the scoping tags.
    pub async fn ensure_payload_indexes(&self) -> Result<(), QdrantError> {
        for field in KEYWORD_FIELDS {
            let body = json!({
                "field_name": field,
                "field_schema": "keyword",
            });

            let response = self
                .request(Method::PUT, &format!("collections/{}/index", self.collection))
                .query(&[("wait", true)])
                .json(&body)
                .send()
                .await?;

            if response.status().is_success() {
                tracing::debug!(collection = %self.collection, field, "Payload index ensured");
            } else if response.status() == StatusCode::CONFLICT {
                tracing::debug!(collection = %self.collection, field, "Payload index already exists");
            } else {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let error = QdrantError::UnexpectedStatus { status, body };
                tracing::error!(collection = %self.collection, field, error = %error, "Failed to ensure payload index");
                return Err(error);
            }
        }

        Ok(())
    }

    /// Write points, overwriting any existing point with the same id.
    pub async fn upsert_points(&self, chunks: &[IndexedChunk]) -> Result<usize, QdrantError> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let now = current_timestamp_rfc3339();
        let serialized: Vec<_> = chunks
            .iter()
            .map(|chunk| {
                json!({
                    "id": chunk.id.to_string(),
                    "vector": chunk.vector,
                    "payload": build_payload(chunk, &now),
                })
            })
            .collect();

        let point_count = serialized.len();
        let response = self
            .request(
                Method::PUT,
                &format!("collections/{}/points", self.collection),
            )
            .query(&[("wait", true)])
            .json(&json!({ "points": serialized }))
            .send()
            .await?;

        self.ensure_success(response, || {
            tracing::debug!(
                collection = %self.collection,
                points = point_count,
                "Points upserted"
            );
        })
        .await?;

        Ok(point_count)
    }

    /// Perform a filtered similarity search, returning scored payloads.
    pub async fn search_points(
        &self,
        vector: &[f32],
        filter: Value,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, QdrantError> {
        let body = json!({
            "query": vector,
            "limit": limit,
            "with_payload": true,
            "filter": filter,
        });

        let response = self
            .request(
                Method::POST,
                &format!("collections/{}/points/query", self.collection),
            )
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = QdrantError::UnexpectedStatus { status, body };
            tracing::error!(collection = %self.collection, error = %error, "Qdrant search failed");
            return Err(error);
        }

        let payload: QueryResponse = response.json().await?;
        let points = match payload.result {
            QueryResponseResult::Points(points) => points,
            QueryResponseResult::Object { points } => points,
        };
        Ok(points
            .into_iter()
            .map(|point| ScoredPoint {
                id: stringify_point_id(point.id),
                score: point.score,
                payload: point.payload,
            })
            .collect())
    }

    async fn collection_exists(&self) -> Result<bool, QdrantError> {
        let response = self
            .request(Method::GET, &format!("collections/{}", self.collection))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                let error = QdrantError::UnexpectedStatus { status, body };
                tracing::error!(collection = %self.collection, error = %error, "Collection existence check failed");
                Err(error)
            }
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("api-key", api_key);
        }
        req
    }

    async fn ensure_success<F>(
        &self,
        response: reqwest::Response,
        on_success: F,
    ) -> Result<(), QdrantError>
    where
        F: FnOnce(),
    {
        if response.status().is_success() {
            on_success();
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = QdrantError::UnexpectedStatus { status, body };
            tracing::error!(error = %error, "Qdrant request failed");
            Err(error)
        }
    }
}

#[async_trait]
impl VectorIndex for QdrantService {
    async fn ensure_ready(&self) -> Result<(), IndexError> {
        self.create_collection_if_not_exists().await?;
        self.ensure_payload_indexes().await?;
        Ok(())
    }

    async fn upsert(&self, chunks: Vec<IndexedChunk>) -> Result<usize, IndexError> {
        if let Some(chunk) = chunks.iter().find(|chunk| chunk.vector.len() != self.dimension) {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: chunk.vector.len(),
            });
        }
        Ok(self.upsert_points(&chunks).await?)
    }

    async fn query(
        &self,
        vector: &[f32],
        scope: &ChunkScope,
        limit: usize,
    ) -> Result<Vec<ChunkHit>, IndexError> {
        let points = self
            .search_points(vector, scope_filter(scope), limit)
            .await?;
        Ok(points
            .into_iter()
            .filter_map(|point| {
                let hit = point
                    .payload
                    .as_ref()
                    .and_then(|payload| parse_hit(payload, point.score));
                if hit.is_none() {
                    tracing::warn!(point_id = %point.id, "Dropping point without chunk tags");
                }
                hit
            })
            // The filter already scopes the query; this guards against a misconfigured index.
            .filter(|hit| {
                hit.tags.tenant_id == scope.tenant_id && hit.tags.document_id == scope.document_id
            })
            .collect())
    }
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

fn stringify_point_id(id: Value) -> String {
    match id {
        Value::String(text) => text,
        Value::Number(number) => number.to_string(),
        Value::Object(map) => map
            .get("uuid")
            .map(|value| match value {
                Value::String(uuid) => uuid.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| Value::Object(map).to_string()),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
