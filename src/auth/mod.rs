//! Bearer token verification.
//!
//! Tokens are compact JWS strings signed with RS256 by an external identity provider. Public keys
//! come from the issuer's JWKS endpoint and are cached process-wide by [`JwksCache`]; a token whose
//! key id is unknown forces one refresh before it is rejected, so key rotation needs no restart.

pub mod jwks;
pub mod verifier;

#[cfg(test)]
pub(crate) mod test_support;

pub use jwks::{HttpJwksFetcher, Jwk, JwksCache, JwksFetcher, KeySet};
pub use verifier::TokenVerifier;

use thiserror::Error;

/// Reasons a bearer token is rejected.
///
/// The HTTP layer collapses every variant into one generic 401; the distinctions exist for logs.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Token is not three base64url segments of JSON.
    #[error("malformed token: {0}")]
    MalformedToken(String),
    /// Header declares an algorithm other than RS256.
    #[error("unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),
    /// Signature does not verify under the located key.
    #[error("invalid token signature")]
    InvalidSignature,
    /// Current time is at or past `exp`.
    #[error("token expired")]
    Expired,
    /// Current time is before `nbf`.
    #[error("token not active yet")]
    NotYetValid,
    /// `iss` differs from the configured issuer.
    #[error("invalid token issuer")]
    IssuerMismatch,
    /// `aud` does not contain the configured audience.
    #[error("invalid token audience")]
    AudienceMismatch,
    /// `azp` differs from the configured authorized party.
    #[error("invalid token authorized party")]
    AuthorizedPartyMismatch,
    /// No signing key matches the header's key id, even after a refresh.
    #[error("no signing key found for kid {0:?}")]
    KeyNotFound(Option<String>),
    /// The key set could not be fetched or was empty.
    #[error("signing keys unavailable: {0}")]
    UpstreamUnavailable(String),
    /// Token carries none of the subject claims.
    #[error("token is missing a subject")]
    MissingSubject,
}

/// Identity extracted from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity {
    /// External subject identifier (stable per end user).
    pub subject: String,
    /// Email address, when the token carries one.
    pub email: Option<String>,
    /// Display name, when the token carries one.
    pub name: Option<String>,
}
