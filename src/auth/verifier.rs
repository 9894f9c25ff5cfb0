//! RS256 token verification and identity extraction.

use crate::auth::{AuthError, AuthenticatedIdentity, HttpJwksFetcher, JwksCache, JwksFetcher};
use crate::config::AuthSettings;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rsa::Pkcs1v15Sign;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

const SUPPORTED_ALGORITHM: &str = "RS256";
const SUBJECT_CLAIMS: [&str; 4] = ["sub", "user_id", "userId", "sid"];
const EMAIL_CLAIMS: [&str; 3] = ["email", "email_address", "primary_email"];

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    alg: Option<String>,
    #[serde(default)]
    kid: Option<String>,
}

/// Verifies bearer tokens against the issuer's cached signing keys.
pub struct TokenVerifier {
    keys: JwksCache,
    issuer: String,
    audience: Option<String>,
    authorized_party: Option<String>,
}

impl TokenVerifier {
    /// Build a verifier that fetches keys from the configured JWKS endpoint.
    pub fn from_settings(settings: &AuthSettings) -> Result<Self, AuthError> {
        let fetcher = Arc::new(HttpJwksFetcher::new(settings.jwks_url.clone())?);
        Ok(Self::new(settings, fetcher))
    }

    /// Build a verifier with an explicit key source.
    pub fn new(settings: &AuthSettings, fetcher: Arc<dyn JwksFetcher>) -> Self {
        Self {
            keys: JwksCache::new(fetcher, settings.jwks_cache_ttl),
            issuer: settings.issuer.trim_end_matches('/').to_string(),
            audience: settings.audience.clone(),
            authorized_party: settings.authorized_party.clone(),
        }
    }

    /// Verify `token` at the current wall-clock time.
    pub async fn verify(&self, token: &str) -> Result<AuthenticatedIdentity, AuthError> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        self.verify_at(token, now).await
    }

    /// Verify `token` as of `now` (unix seconds).
    pub async fn verify_at(
        &self,
        token: &str,
        now: i64,
    ) -> Result<AuthenticatedIdentity, AuthError> {
        let segments: Vec<&str> = token.split('.').collect();
        let [header_segment, payload_segment, signature_segment] = segments[..] else {
            return Err(AuthError::MalformedToken(format!(
                "expected 3 segments, found {}",
                segments.len()
            )));
        };

        let header: Header = decode_segment(header_segment, "header")?;
        let claims: Map<String, Value> = decode_segment(payload_segment, "payload")?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_segment)
            .map_err(|_| AuthError::MalformedToken("signature is not base64url".into()))?;

        match header.alg.as_deref() {
            Some(SUPPORTED_ALGORITHM) => {}
            other => {
                return Err(AuthError::UnsupportedAlgorithm(
                    other.unwrap_or("none").to_string(),
                ));
            }
        }

        let key = self.keys.find_key(header.kid.as_deref()).await?;
        let signing_input = &token[..header_segment.len() + 1 + payload_segment.len()];
        let digest = Sha256::digest(signing_input.as_bytes());
        key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        self.validate_time_claims(&claims, now)?;
        self.validate_identity_claims(&claims)?;
        extract_identity(&claims)
    }

    fn validate_time_claims(&self, claims: &Map<String, Value>, now: i64) -> Result<(), AuthError> {
        if let Some(exp) = numeric_claim(claims, "exp")
            && now >= exp
        {
            return Err(AuthError::Expired);
        }
        if let Some(nbf) = numeric_claim(claims, "nbf")
            && now < nbf
        {
            return Err(AuthError::NotYetValid);
        }
        Ok(())
    }

    fn validate_identity_claims(&self, claims: &Map<String, Value>) -> Result<(), AuthError> {
        let issuer = claims
            .get("iss")
            .and_then(Value::as_str)
            .map(|iss| iss.trim_end_matches('/'));
        if issuer != Some(self.issuer.as_str()) {
            return Err(AuthError::IssuerMismatch);
        }

        if let Some(expected) = &self.audience {
            let accepted = match claims.get("aud") {
                Some(Value::String(aud)) => aud == expected,
                Some(Value::Array(values)) => values
                    .iter()
                    .any(|value| value.as_str() == Some(expected.as_str())),
                _ => false,
            };
            if !accepted {
                return Err(AuthError::AudienceMismatch);
            }
        }

        if let Some(expected) = &self.authorized_party
            && claims.get("azp").and_then(Value::as_str) != Some(expected.as_str())
        {
            return Err(AuthError::AuthorizedPartyMismatch);
        }

        Ok(())
    }
}

fn decode_segment<T: DeserializeOwned>(segment: &str, part: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::MalformedToken(format!("{part} is not base64url")))?;
    serde_json::from_slice(&bytes)
        .map_err(|_| AuthError::MalformedToken(format!("{part} is not a JSON object")))
}

fn numeric_claim(claims: &Map<String, Value>, name: &str) -> Option<i64> {
    let value = claims.get(name)?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|seconds| seconds.floor() as i64))
}

fn string_claim(claims: &Map<String, Value>, name: &str) -> Option<String> {
    claims
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn extract_identity(claims: &Map<String, Value>) -> Result<AuthenticatedIdentity, AuthError> {
    let subject = SUBJECT_CLAIMS
        .iter()
        .find_map(|name| string_claim(claims, name))
        .ok_or(AuthError::MissingSubject)?;

    let email = EMAIL_CLAIMS
        .iter()
        .find_map(|name| string_claim(claims, name))
        .or_else(|| {
            claims
                .get("email_addresses")
                .and_then(Value::as_array)
                .and_then(|addresses| addresses.first())
                .and_then(|first| first.get("email_address"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

    let name = string_claim(claims, "name").or_else(|| {
        let joined = ["first_name", "last_name"]
            .iter()
            .filter_map(|part| string_claim(claims, part))
            .collect::<Vec<_>>()
            .join(" ");
        (!joined.is_empty()).then_some(joined)
    });

    Ok(AuthenticatedIdentity {
        subject,
        email,
        name,
    })
}
