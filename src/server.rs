//! HTTP server: router assembly, background tasks and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    routing::{delete, get, patch, put},
};
use catalog_scope::validate_prefix;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::authority::{InMemoryLibraryDirectory, LibraryId, LibraryRecord, ScopeAuthority};
use crate::config::Config;
use crate::credentials::{DirectoryVerifier, InMemoryUserDirectory, PasswordHasher};
use crate::gate::{Access, AuthorizationGate, Principal, guarded};
use crate::token::{InMemoryTokenStore, TokenService, TokenStore, handler::token_routes, spawn_reaper};
use crate::{Error, Result};

/// Shared state behind every route.
pub struct AppState {
    /// Token lifecycle
    pub tokens: Arc<TokenService>,
    /// Authorization gate
    pub gate: Arc<AuthorizationGate>,
    /// Scope authority (owns the library scope index)
    pub authority: Arc<ScopeAuthority>,
    /// Library directory
    pub libraries: Arc<InMemoryLibraryDirectory>,
}

impl AppState {
    /// Wire the in-memory collaborators from configuration.
    pub fn from_config(config: &Config, hasher: Arc<dyn PasswordHasher>) -> Result<Self> {
        let store: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::new());
        let users = Arc::new(InMemoryUserDirectory::from_config(&config.users));
        let libraries = Arc::new(InMemoryLibraryDirectory::from_config(&config.libraries));

        let verifier = Arc::new(DirectoryVerifier::new(users, hasher));
        let tokens = Arc::new(TokenService::new(
            Arc::clone(&store),
            verifier,
            &config.tokens,
        )?);
        let authority = Arc::new(ScopeAuthority::new(libraries.clone()));
        let gate = Arc::new(AuthorizationGate::new(store, Arc::clone(&authority)));

        Ok(Self {
            tokens,
            gate,
            authority,
            libraries,
        })
    }
}

/// Build the application router.
///
/// | Method | Path | Access |
/// |--------|------|--------|
/// | `GET` | `/health` | none |
/// | `POST` | `/token` | none |
/// | `DELETE` | `/token` | any |
/// | `GET` | `/me` | any |
/// | `GET` | `/libraries/{library_id}` | regular |
/// | `PATCH` | `/libraries/{library_id}` | admin |
/// | `PUT` | `/libraries/{library_id}/scope` | superuser |
/// | `DELETE` | `/scope-cache` | superuser |
pub fn create_router(state: Arc<AppState>, max_body_size: usize) -> Router {
    let gate = Arc::clone(&state.gate);

    Router::new()
        .route("/health", get(health_handler))
        .route("/me", guarded(get(me_handler), Arc::clone(&gate), Access::Any))
        .route(
            "/libraries/{library_id}",
            guarded(get(get_library), Arc::clone(&gate), Access::Regular).merge(guarded(
                patch(rename_library),
                Arc::clone(&gate),
                Access::Admin,
            )),
        )
        .route(
            "/libraries/{library_id}/scope",
            guarded(put(set_library_scope), Arc::clone(&gate), Access::Superuser),
        )
        .route(
            "/scope-cache",
            guarded(delete(clear_scope_cache), Arc::clone(&gate), Access::Superuser),
        )
        .with_state(Arc::clone(&state))
        .merge(token_routes(Arc::clone(&state.tokens), gate))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /me`: who the presented token belongs to.
async fn me_handler(Extension(principal): Extension<Principal>) -> Json<Value> {
    Json(json!({
        "user_id": principal.user_id,
        "scope": principal.scope,
    }))
}

async fn get_library(
    State(state): State<Arc<AppState>>,
    Path(library_id): Path<LibraryId>,
) -> Result<Json<LibraryRecord>> {
    state
        .libraries
        .get(library_id)
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("library {library_id}")))
}

#[derive(Debug, Deserialize)]
struct RenameLibrary {
    name: String,
}

async fn rename_library(
    State(state): State<Arc<AppState>>,
    Path(library_id): Path<LibraryId>,
    Json(body): Json<RenameLibrary>,
) -> Result<Json<LibraryRecord>> {
    state
        .libraries
        .rename(library_id, body.name)
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("library {library_id}")))
}

#[derive(Debug, Deserialize)]
struct SetLibraryScope {
    scope: String,
}

/// `PUT /libraries/{library_id}/scope`: move a library to a new scope
/// prefix. Tokens granted on the old prefix stop matching immediately.
async fn set_library_scope(
    State(state): State<Arc<AppState>>,
    Path(library_id): Path<LibraryId>,
    Json(body): Json<SetLibraryScope>,
) -> Result<Json<LibraryRecord>> {
    validate_prefix(&body.scope).map_err(|e| Error::InvalidRequest(e.to_string()))?;
    if !state.libraries.set_scope(library_id, body.scope) {
        return Err(Error::NotFound(format!("library {library_id}")));
    }
    state.authority.clear_mapping();
    info!(library_id, "Library scope changed");

    state
        .libraries
        .get(library_id)
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("library {library_id}")))
}

/// `DELETE /scope-cache`: invalidate the library scope index.
async fn clear_scope_cache(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> StatusCode {
    state.authority.clear_mapping();
    info!(user_id = principal.user_id, "Library scope index cleared");
    StatusCode::NO_CONTENT
}

/// Catalog Gate server
pub struct Server {
    config: Config,
    hasher: Arc<dyn PasswordHasher>,
}

impl Server {
    /// Create a new server
    #[must_use]
    pub fn new(config: Config, hasher: Arc<dyn PasswordHasher>) -> Self {
        Self { config, hasher }
    }

    /// Run the server until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let state = Arc::new(AppState::from_config(&self.config, self.hasher)?);
        let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

        let reaper = spawn_reaper(
            Arc::clone(&state.tokens),
            self.config.tokens.purge_interval,
            self.config.tokens.purge_grace,
            shutdown_tx.subscribe(),
        );

        let app = create_router(state, self.config.server.max_body_size);
        let listener = TcpListener::bind(addr).await?;

        info!(
            host = %self.config.server.host,
            port = self.config.server.port,
            users = self.config.users.len(),
            libraries = self.config.libraries.len(),
            rotate_refresh_tokens = self.config.tokens.rotate_refresh_tokens,
            "Listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        if tokio::time::timeout(self.config.server.shutdown_timeout, reaper)
            .await
            .is_err()
        {
            warn!("Token reaper did not stop within the shutdown timeout");
        }

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
