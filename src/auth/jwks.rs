//! JWKS retrieval and the shared signing key cache.

use crate::auth::AuthError;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use reqwest::Client;
use rsa::{BigUint, RsaPublicKey};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// One entry of a JSON Web Key Set. Only RSA keys are usable.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type (`RSA`).
    pub kty: String,
    /// Key identifier referenced by token headers.
    #[serde(default)]
    pub kid: Option<String>,
    /// Declared algorithm, if any.
    #[serde(default)]
    pub alg: Option<String>,
    /// Base64url modulus.
    #[serde(default)]
    pub n: Option<String>,
    /// Base64url public exponent.
    #[serde(default)]
    pub e: Option<String>,
}

#[derive(Deserialize)]
struct JwksDocument {
    #[serde(default)]
    keys: Vec<Jwk>,
}

/// Source of the issuer's published keys.
#[async_trait]
pub trait JwksFetcher: Send + Sync {
    /// Fetch the current key set.
    async fn fetch(&self) -> Result<Vec<Jwk>, AuthError>;
}

/// Fetches keys from an HTTP JWKS endpoint.
pub struct HttpJwksFetcher {
    client: Client,
    url: String,
}

impl HttpJwksFetcher {
    /// Build a fetcher for the given JWKS URL.
    pub fn new(url: impl Into<String>) -> Result<Self, AuthError> {
        let client = Client::builder()
            .user_agent("docquery/0.1")
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| AuthError::UpstreamUnavailable(err.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self) -> Result<Vec<Jwk>, AuthError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| AuthError::UpstreamUnavailable(err.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::UpstreamUnavailable(format!(
                "JWKS endpoint returned {}",
                response.status()
            )));
        }

        let document: JwksDocument = response
            .json()
            .await
            .map_err(|err| AuthError::UpstreamUnavailable(err.to_string()))?;
        Ok(document.keys)
    }
}

/// Immutable snapshot of usable RSA keys, replaced wholesale on refresh.
pub struct KeySet {
    keys: HashMap<Option<String>, RsaPublicKey>,
    fetched_at: Instant,
    generation: u64,
}

impl KeySet {
    fn from_jwks(jwks: Vec<Jwk>, generation: u64) -> Self {
        let mut keys = HashMap::new();
        for jwk in jwks {
            if !jwk.kty.eq_ignore_ascii_case("RSA") {
                continue;
            }
            if let Some(alg) = jwk.alg.as_deref()
                && alg != "RS256"
            {
                continue;
            }
            match rsa_public_key(&jwk) {
                Some(key) => {
                    keys.insert(jwk.kid.clone(), key);
                }
                None => tracing::warn!(kid = ?jwk.kid, "Skipping unusable JWKS entry"),
            }
        }
        Self {
            keys,
            fetched_at: Instant::now(),
            generation,
        }
    }

    /// Find the key with the given identifier.
    pub fn find(&self, kid: Option<&str>) -> Option<&RsaPublicKey> {
        self.keys.get(&kid.map(str::to_string))
    }

    /// Number of usable keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set holds no usable keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

fn rsa_public_key(jwk: &Jwk) -> Option<RsaPublicKey> {
    let n = URL_SAFE_NO_PAD.decode(jwk.n.as_deref()?.trim_end_matches('=')).ok()?;
    let e = URL_SAFE_NO_PAD.decode(jwk.e.as_deref()?.trim_end_matches('=')).ok()?;
    RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e)).ok()
}

/// Process-wide cache of the issuer's signing keys.
///
/// Readers clone an `Arc<KeySet>` under a short read lock. Refreshes are single-flight: callers
/// that find a stale set queue on `refresh_gate`, and whoever arrives after a successful refresh
/// reuses the new set instead of fetching again.
pub struct JwksCache {
    fetcher: Arc<dyn JwksFetcher>,
    ttl: Duration,
    current: RwLock<Option<Arc<KeySet>>>,
    refresh_gate: Mutex<()>,
}

impl JwksCache {
    /// Create an empty cache; the first lookup fetches.
    pub fn new(fetcher: Arc<dyn JwksFetcher>, ttl: Duration) -> Self {
        Self {
            fetcher,
            ttl,
            current: RwLock::new(None),
            refresh_gate: Mutex::new(()),
        }
    }

    fn snapshot(&self) -> Option<Arc<KeySet>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn install(&self, keys: Arc<KeySet>) {
        match self.current.write() {
            Ok(mut guard) => *guard = Some(keys),
            Err(poisoned) => *poisoned.into_inner() = Some(keys),
        }
    }

    /// Return the cached key set, fetching when absent or older than the TTL.
    pub async fn keys(&self) -> Result<Arc<KeySet>, AuthError> {
        if let Some(keys) = self.snapshot()
            && keys.is_fresh(self.ttl)
        {
            return Ok(keys);
        }
        self.refresh(None).await
    }

    /// Refresh the key set.
    ///
    /// With `stale_generation` set, the refresh is skipped if another caller already replaced
    /// that generation; otherwise it is skipped only if the current set is fresh.
    pub async fn refresh(&self, stale_generation: Option<u64>) -> Result<Arc<KeySet>, AuthError> {
        let _gate = self.refresh_gate.lock().await;

        let previous = self.snapshot();
        if let Some(keys) = &previous {
            let replaced = match stale_generation {
                Some(generation) => keys.generation != generation,
                None => keys.is_fresh(self.ttl),
            };
            if replaced {
                return Ok(keys.clone());
            }
        }

        let generation = previous.as_ref().map_or(1, |keys| keys.generation + 1);
        let jwks = self.fetcher.fetch().await?;
        let keys = Arc::new(KeySet::from_jwks(jwks, generation));
        if keys.is_empty() {
            return Err(AuthError::UpstreamUnavailable(
                "JWKS does not contain any usable signing keys".into(),
            ));
        }

        tracing::debug!(keys = keys.len(), generation, "Refreshed signing keys");
        self.install(keys.clone());
        Ok(keys)
    }

    /// Locate the key for `kid`, forcing one refresh when it is not in the cached set.
    pub async fn find_key(&self, kid: Option<&str>) -> Result<RsaPublicKey, AuthError> {
        let keys = self.keys().await?;
        if let Some(key) = keys.find(kid) {
            return Ok(key.clone());
        }

        tracing::debug!(?kid, "Signing key not cached; refreshing");
        let refreshed = self.refresh(Some(keys.generation)).await?;
        refreshed
            .find(kid)
            .cloned()
            .ok_or_else(|| AuthError::KeyNotFound(kid.map(str::to_string)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: AtomicUsize,
        keys: Vec<Jwk>,
    }

    #[async_trait]
    impl JwksFetcher for CountingFetcher {
        async fn fetch(&self) -> Result<Vec<Jwk>, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(self.keys.clone())
        }
    }

    fn rsa_jwk(kid: &str) -> Jwk {
        crate::auth::test_support::jwk(kid)
    }

    #[test]
    fn key_set_skips_non_rsa_entries() {
        let mut ec = rsa_jwk("ec");
        ec.kty = "EC".into();
        let set = KeySet::from_jwks(vec![rsa_jwk("a"), ec], 1);
        assert_eq!(set.len(), 1);
        assert!(set.find(Some("a")).is_some());
        assert!(set.find(Some("ec")).is_none());
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_fetch() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            keys: vec![rsa_jwk("a")],
        });
        let cache = Arc::new(JwksCache::new(fetcher.clone(), Duration::from_secs(60)));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let cache = cache.clone();
            tasks.spawn(async move { cache.find_key(Some("a")).await.is_ok() });
        }
        while let Some(result) = tasks.join_next().await {
            assert!(result.expect("task"));
        }

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_kid_forces_a_single_refresh() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            keys: vec![rsa_jwk("a")],
        });
        let cache = JwksCache::new(fetcher.clone(), Duration::from_secs(60));

        let err = cache.find_key(Some("rotated")).await.expect_err("unknown kid");
        assert!(matches!(err, AuthError::KeyNotFound(Some(ref kid)) if kid == "rotated"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_key_set_is_upstream_unavailable() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            keys: Vec::new(),
        });
        let cache = JwksCache::new(fetcher, Duration::from_secs(60));
        let err = cache.keys().await.err().expect("empty set rejected");
        assert!(matches!(err, AuthError::UpstreamUnavailable(_)));
    }
}
