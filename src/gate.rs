//! Authorization gate for catalog routes.
//!
//! Every route declares an [`Access`] level. The gate turns the request's
//! `Authorization` header, that level and (for library routes) the library
//! id from the path into an allow/deny decision.
//!
//! Precedence:
//!
//! 1. `none` allows without looking at the header.
//! 2. The header must be `Bearer <token>`.
//! 3. The token must exist in the store.
//! 4. The token must not be expired.
//! 5. The token's scope must satisfy the route's requirement.
//!
//! Denial never mutates state.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{RawPathParams, Request, State, rejection::RawPathParamsRejection},
    http::header::AUTHORIZATION,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::MethodRouter,
};
use catalog_scope::{Requirement, Role, ScopeGrant};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::authority::{LibraryId, ScopeAuthority};
use crate::credentials::UserId;
use crate::token::{
    audit::{self, AuditEvent},
    store::TokenStore,
};
use crate::{Error, Result};

/// Header missing, malformed, or not a bearer token.
pub const NO_ACCESS_TOKEN: &str = "No access token presented";
/// Token not found in the store.
pub const INVALID_ACCESS_TOKEN: &str = "Invalid access token";
/// Token past its expiry.
pub const ACCESS_TOKEN_EXPIRED: &str = "Access token expired";
/// Token scope does not meet the route's requirement.
pub const SCOPE_NOT_AUTHORIZED: &str = "Required scope not authorized";

/// Path parameter carrying the library id on library routes.
pub const LIBRARY_ID_PARAM: &str = "library_id";

/// Access level a route demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    /// Public.
    None,
    /// Any valid token.
    Any,
    /// `regular` or better in the route's library.
    Regular,
    /// `admin` in the route's library.
    Admin,
    /// The `superuser` grant.
    Superuser,
}

impl Access {
    /// String form used in configuration and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Any => "any",
            Self::Regular => "regular",
            Self::Admin => "admin",
            Self::Superuser => "superuser",
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Access {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "any" => Ok(Self::Any),
            "regular" => Ok(Self::Regular),
            "admin" => Ok(Self::Admin),
            "superuser" => Ok(Self::Superuser),
            other => Err(Error::Config(format!("unknown access level: {other}"))),
        }
    }
}

/// The caller behind an authorized request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// User id
    pub user_id: UserId,
    /// Scope of the presented token
    pub scope: String,
    /// The presented access token
    pub token: String,
}

/// Request-time allow/deny decisions.
pub struct AuthorizationGate {
    store: Arc<dyn TokenStore>,
    authority: Arc<ScopeAuthority>,
}

impl AuthorizationGate {
    /// Create a gate.
    #[must_use]
    pub fn new(store: Arc<dyn TokenStore>, authority: Arc<ScopeAuthority>) -> Self {
        Self { store, authority }
    }

    /// Decide a request.
    ///
    /// Returns `Ok(None)` for public routes, `Ok(Some(principal))` when a
    /// token was presented and accepted, and [`Error::Forbidden`] on denial.
    pub async fn authorize(
        &self,
        header: Option<&str>,
        access: Access,
        library_id: Option<LibraryId>,
    ) -> Result<Option<Principal>> {
        if access == Access::None {
            return Ok(None);
        }

        let Some(presented) = header.and_then(bearer_token) else {
            return Err(deny(NO_ACCESS_TOKEN, None, access));
        };

        let Some(token) = self.store.get_access(presented).await? else {
            return Err(deny(INVALID_ACCESS_TOKEN, Some(presented), access));
        };

        if token.is_expired_at(Utc::now()) {
            return Err(deny(ACCESS_TOKEN_EXPIRED, Some(presented), access));
        }

        let requirement = match access {
            Access::None | Access::Any => Requirement::Any,
            Access::Superuser => Requirement::Grant(ScopeGrant::Superuser),
            Access::Regular | Access::Admin => {
                let role = if access == Access::Admin {
                    Role::Admin
                } else {
                    Role::Regular
                };
                let Some(library_id) = library_id else {
                    debug!(%access, "Library route without a library id");
                    return Err(deny(SCOPE_NOT_AUTHORIZED, Some(presented), access));
                };
                match self.authority.required_scope(library_id, role).await {
                    Ok(grant) => Requirement::Grant(grant),
                    Err(Error::NotFound(_)) => {
                        debug!(library_id, "Unknown library");
                        return Err(deny(SCOPE_NOT_AUTHORIZED, Some(presented), access));
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        if !self.authority.satisfies(&token.scope, &requirement) {
            return Err(deny(SCOPE_NOT_AUTHORIZED, Some(presented), access));
        }

        Ok(Some(Principal {
            user_id: token.user_id,
            scope: token.scope,
            token: token.token,
        }))
    }
}

/// Extract the token from `Bearer <token>`. The scheme is case-insensitive;
/// the token must be a single word.
fn bearer_token(header: &str) -> Option<&str> {
    let mut parts = header.split_whitespace();
    let scheme = parts.next()?;
    let token = parts.next()?;
    (scheme.eq_ignore_ascii_case("bearer") && parts.next().is_none()).then_some(token)
}

fn deny(reason: &'static str, token: Option<&str>, access: Access) -> Error {
    audit::emit(&AuditEvent::access_denied(reason, token, access.as_str()));
    Error::Forbidden(reason.to_string())
}

#[derive(Clone)]
struct Guard {
    gate: Arc<AuthorizationGate>,
    access: Access,
}

/// Guard `route` with the gate at `access`.
///
/// On success the [`Principal`] is placed in the request extensions; denials
/// render `403` with a JSON body.
pub fn guarded<S>(route: MethodRouter<S>, gate: Arc<AuthorizationGate>, access: Access) -> MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    route.route_layer(middleware::from_fn_with_state(
        Guard { gate, access },
        require_access,
    ))
}

async fn require_access(
    State(guard): State<Guard>,
    params: std::result::Result<RawPathParams, RawPathParamsRejection>,
    mut request: Request,
    next: Next,
) -> Response {
    let library_id = params.ok().and_then(|params| {
        params
            .iter()
            .find(|(key, _)| *key == LIBRARY_ID_PARAM)
            .and_then(|(_, value)| value.parse::<LibraryId>().ok())
    });
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    match guard
        .gate
        .authorize(header.as_deref(), guard.access, library_id)
        .await
    {
        Ok(Some(principal)) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Ok(None) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}
