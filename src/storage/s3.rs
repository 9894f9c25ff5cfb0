//! Amazon S3 blob store.
//!
//! Objects are written and read with the S3 REST API, signed with AWS Signature Version 4 using
//! `hmac` + `sha2`. A custom endpoint (MinIO, LocalStack) switches to path-style addressing.
//!
//! Credentials come from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, and the optional
//! `AWS_SESSION_TOKEN`.

use crate::config::StorageProviderKind;
use crate::storage::{BlobStore, StorageError, StorageLocator, ensure_provider};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

/// Static AWS credentials.
#[derive(Clone)]
pub struct AwsCredentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token for temporary credentials.
    pub session_token: Option<String>,
}

impl AwsCredentials {
    /// Read credentials from the standard AWS environment variables.
    pub fn from_env() -> Result<Self, StorageError> {
        let read = |key: &str| std::env::var(key).ok().filter(|value| !value.is_empty());
        Ok(Self {
            access_key_id: read("AWS_ACCESS_KEY_ID")
                .ok_or_else(|| StorageError::Misconfigured("AWS_ACCESS_KEY_ID is not set".into()))?,
            secret_access_key: read("AWS_SECRET_ACCESS_KEY").ok_or_else(|| {
                StorageError::Misconfigured("AWS_SECRET_ACCESS_KEY is not set".into())
            })?,
            session_token: read("AWS_SESSION_TOKEN"),
        })
    }
}

/// Blob store backed by an S3 bucket.
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    region: String,
    endpoint: Option<String>,
    credentials: AwsCredentials,
}

struct SignedTarget {
    url: String,
    host: String,
    canonical_uri: String,
}

impl S3BlobStore {
    /// Create a store for `bucket` in `region`, optionally against a custom endpoint.
    pub fn new(
        bucket: String,
        region: String,
        endpoint: Option<String>,
        credentials: AwsCredentials,
    ) -> Result<Self, StorageError> {
        let client = Client::builder().user_agent("docquery/0.1").build()?;
        Ok(Self {
            client,
            bucket,
            region,
            endpoint: endpoint.map(|value| value.trim_end_matches('/').to_string()),
            credentials,
        })
    }

    fn target(&self, key: &str) -> SignedTarget {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match &self.endpoint {
            Some(endpoint) => {
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .to_string();
                let canonical_uri = format!("/{}/{}", self.bucket, encoded_key);
                SignedTarget {
                    url: format!("{endpoint}{canonical_uri}"),
                    host,
                    canonical_uri,
                }
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", self.bucket, self.region);
                let canonical_uri = format!("/{encoded_key}");
                SignedTarget {
                    url: format!("https://{host}{canonical_uri}"),
                    host,
                    canonical_uri,
                }
            }
        }
    }

    fn signed_request(
        &self,
        method: Method,
        key: &str,
        payload: &[u8],
        content_type: Option<&str>,
        now: OffsetDateTime,
    ) -> reqwest::RequestBuilder {
        let target = self.target(key);
        let (date_stamp, amz_date) = amz_timestamps(now);
        let payload_hash = hex_sha256(payload);

        let mut headers = vec![
            ("host".to_string(), target.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(content_type) = content_type {
            headers.push(("content-type".to_string(), content_type.to_string()));
        }
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers = headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{}\n", value.trim()))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method.as_str(),
            target.canonical_uri,
            canonical_headers,
            signed_headers,
            payload_hash
        );
        let credential_scope = format!("{date_stamp}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(
            &self.credentials.secret_access_key,
            &date_stamp,
            &self.region,
            "s3",
        );
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.credentials.access_key_id
        );

        let mut request = self
            .client
            .request(method, &target.url)
            .header("authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date);
        if let Some(content_type) = content_type {
            request = request.header("content-type", content_type);
        }
        if let Some(token) = &self.credentials.session_token {
            request = request.header("x-amz-security-token", token);
        }
        request
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn provider(&self) -> StorageProviderKind {
        StorageProviderKind::S3
    }

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StorageLocator, StorageError> {
        let size = bytes.len();
        let response = self
            .signed_request(
                Method::PUT,
                key,
                &bytes,
                Some(content_type),
                OffsetDateTime::now_utc(),
            )
            .body(bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!(bucket = %self.bucket, key, %status, "S3 PutObject failed");
            return Err(StorageError::UnexpectedStatus {
                status,
                key: key.to_string(),
            });
        }

        tracing::debug!(bucket = %self.bucket, key, bytes = size, "Stored blob in S3");
        Ok(StorageLocator {
            provider: StorageProviderKind::S3,
            key: key.to_string(),
        })
    }

    async fn get(&self, locator: &StorageLocator) -> Result<Vec<u8>, StorageError> {
        ensure_provider(locator, StorageProviderKind::S3)?;
        let response = self
            .signed_request(
                Method::GET,
                &locator.key,
                b"",
                None,
                OffsetDateTime::now_utc(),
            )
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(locator.key.clone())),
            status => Err(StorageError::UnexpectedStatus {
                status,
                key: locator.key.clone(),
            }),
        }
    }
}

fn amz_timestamps(now: OffsetDateTime) -> (String, String) {
    let date_stamp = format!(
        "{:04}{:02}{:02}",
        now.year(),
        u8::from(now.month()),
        now.day()
    );
    let amz_date = format!(
        "{date_stamp}T{:02}{:02}{:02}Z",
        now.hour(),
        now.minute(),
        now.second()
    );
    (date_stamp, amz_date)
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything except unreserved characters.
fn uri_encode(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}
