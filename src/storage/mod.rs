//! Object storage for uploaded PDFs.
//!
//! The upload handler writes each accepted file once and the ingestion worker reads it back by
//! locator. Keys are namespaced per tenant: `uploads/{tenant_id}/{document_id}`.

pub mod local;
pub mod s3;

pub use local::LocalBlobStore;
pub use s3::{AwsCredentials, S3BlobStore};

use crate::config::{StorageProviderKind, StorageSettings};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by blob storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No object exists under the key.
    #[error("object not found: {0}")]
    NotFound(String),
    /// Key would escape the storage root or is otherwise unusable.
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
    /// Locator names a provider this backend does not serve.
    #[error("locator provider {actual} does not match backend {expected}")]
    ProviderMismatch {
        /// Provider served by this backend.
        expected: &'static str,
        /// Provider recorded in the locator.
        actual: &'static str,
    },
    /// Required setting or credential is missing.
    #[error("storage misconfigured: {0}")]
    Misconfigured(String),
    /// Local filesystem failure.
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Remote store answered with a non-success status.
    #[error("unexpected storage response ({status}) for {key}")]
    UnexpectedStatus {
        /// HTTP status returned by the store.
        status: reqwest::StatusCode,
        /// Key the request addressed.
        key: String,
    },
}

/// Where a blob lives: backend plus key.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StorageLocator {
    /// Backend holding the object.
    pub provider: StorageProviderKind,
    /// Backend-relative key.
    pub key: String,
}

/// Blob storage backend.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Backend kind recorded in locators produced by [`BlobStore::put`].
    fn provider(&self) -> StorageProviderKind;

    /// Durably write `bytes` under `key`.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StorageLocator, StorageError>;

    /// Read the object a locator points at.
    async fn get(&self, locator: &StorageLocator) -> Result<Vec<u8>, StorageError>;
}

/// Storage key for a tenant's document.
pub fn blob_key(tenant_id: i64, document_id: &str) -> String {
    format!("uploads/{tenant_id}/{document_id}")
}

/// Build the backend selected by configuration.
pub fn from_settings(settings: &StorageSettings) -> Result<Arc<dyn BlobStore>, StorageError> {
    match settings.provider {
        StorageProviderKind::Local => Ok(Arc::new(LocalBlobStore::new(&settings.upload_dir))),
        StorageProviderKind::S3 => {
            let bucket = settings
                .s3_bucket
                .clone()
                .ok_or_else(|| StorageError::Misconfigured("S3_BUCKET_NAME is not set".into()))?;
            let region = settings
                .s3_region
                .clone()
                .ok_or_else(|| StorageError::Misconfigured("AWS_REGION is not set".into()))?;
            let credentials = AwsCredentials::from_env()?;
            Ok(Arc::new(S3BlobStore::new(
                bucket,
                region,
                settings.s3_endpoint.clone(),
                credentials,
            )?))
        }
    }
}

pub(crate) fn ensure_provider(
    locator: &StorageLocator,
    expected: StorageProviderKind,
) -> Result<(), StorageError> {
    if locator.provider == expected {
        Ok(())
    } else {
        Err(StorageError::ProviderMismatch {
            expected: expected.as_str(),
            actual: locator.provider.as_str(),
        })
    }
}
