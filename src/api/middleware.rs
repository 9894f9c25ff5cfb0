//! Bearer authentication for protected routes.

use super::{AppState, error::ApiError};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};

/// Verify the bearer token, resolve the tenant, and attach it to the request.
///
/// Every rejection is logged with its reason and answered with the same generic 401.
pub async fn require_tenant(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if request.method() == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let Some(token) = bearer_token(request.headers()) else {
        tracing::warn!(path = %request.uri().path(), "Missing bearer token");
        return Err(ApiError::Unauthorized);
    };
    let identity = match state.verifier.verify(token).await {
        Ok(identity) => identity,
        Err(err) => {
            tracing::warn!(path = %request.uri().path(), reason = %err, "Rejected bearer token");
            return Err(ApiError::Unauthorized);
        }
    };

    let tenant = state.identities.resolve(&identity).await?;
    request.extensions_mut().insert(tenant);
    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
