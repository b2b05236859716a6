//! HTTP handlers for the token endpoint.
//!
//! # Endpoints
//!
//! | Method | Path | Access | Description |
//! |--------|------|--------|-------------|
//! | `POST` | `/token` | none | Password or refresh grant |
//! | `DELETE` | `/token` | any | Revoke the presented access token |
//!
//! ## Token request
//!
//! Either `application/x-www-form-urlencoded` (the OAuth 2.0 default) or
//! JSON:
//!
//! ```json
//! { "grant_type": "password", "username": "alice", "password": "..." }
//! { "grant_type": "refresh_token", "refresh_token": "cgrt_..." }
//! ```
//!
//! Errors use the OAuth error codes: `invalid_grant` for bad credentials and
//! unusable refresh tokens, `unsupported_grant_type`, `invalid_request`.

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{delete, post},
};
use tracing::error;

use super::{
    TokenService,
    audit::{self, AuditEvent},
    issuer::TokenRequest,
};
use crate::gate::{Access, AuthorizationGate, Principal, guarded};
use crate::{Error, Result};

/// Build the token routes.
///
/// `POST /token` is public (it IS the authentication step); `DELETE /token`
/// goes through the gate at [`Access::Any`].
pub fn token_routes(service: Arc<TokenService>, gate: Arc<AuthorizationGate>) -> Router {
    Router::new()
        .route(
            "/token",
            post(issue_token).merge(guarded(delete(revoke_token), gate, Access::Any)),
        )
        .with_state(service)
}

/// Read a token request in whichever encoding the client used.
fn parse_token_request(headers: &HeaderMap, body: &[u8]) -> Result<TokenRequest> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let mime = content_type.split(';').next().unwrap_or_default().trim();

    if mime.eq_ignore_ascii_case("application/json") {
        serde_json::from_slice(body).map_err(|e| Error::InvalidRequest(e.to_string()))
    } else if mime.is_empty() || mime.eq_ignore_ascii_case("application/x-www-form-urlencoded") {
        serde_urlencoded::from_bytes(body).map_err(|e| Error::InvalidRequest(e.to_string()))
    } else {
        Err(Error::InvalidRequest(format!("unsupported content type: {mime}")))
    }
}

/// `POST /token`: exchange credentials or a refresh token for tokens.
async fn issue_token(
    State(service): State<Arc<TokenService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let grant = match parse_token_request(&headers, &body).and_then(TokenRequest::into_grant) {
        Ok(grant) => grant,
        Err(e) => {
            audit::emit(&AuditEvent::denied(e.to_string()));
            return Err(e);
        }
    };

    let issued = service.grant(grant).await?;

    Ok((
        [(header::CACHE_CONTROL, "no-store"), (header::PRAGMA, "no-cache")],
        Json(issued.into_response()),
    ))
}

/// `DELETE /token`: revoke the access token that authorized this request.
async fn revoke_token(
    State(service): State<Arc<TokenService>>,
    Extension(principal): Extension<Principal>,
) -> Result<StatusCode> {
    match service
        .revoke(&principal.token, Some(principal.user_id))
        .await
    {
        Ok(_) => Ok(StatusCode::NO_CONTENT),
        Err(Error::NotFound(_)) => {
            // The gate just found this token; losing it now means a concurrent
            // revocation or purge won the race.
            error!(
                user_id = principal.user_id,
                token = %audit::fingerprint(&principal.token),
                "Authorized access token vanished before revocation"
            );
            Err(Error::Internal("access token vanished".to_string()))
        }
        Err(e) => Err(e),
    }
}
