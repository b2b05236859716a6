//! Shared fixtures for the HTTP-level tests.

#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode, header},
};
use catalog_gate::{
    config::{Config, LibraryConfig, TokenConfig, UserConfig},
    credentials::{Argon2Hasher, PasswordHasher},
    server::{AppState, create_router},
    token::TokenResponse,
};
use serde_json::Value;
use tower::ServiceExt;

/// Password shared by every fixture user.
pub const PASSWORD: &str = "correct horse";

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

fn hasher() -> Argon2Hasher {
    Argon2Hasher::with_params(8, 1, 1).unwrap()
}

fn user(hasher: &Argon2Hasher, id: u64, username: &str, scope: &str, active: bool) -> UserConfig {
    UserConfig {
        id,
        username: username.to_string(),
        password_hash: hasher.hash(PASSWORD).unwrap(),
        scope: scope.to_string(),
        active,
    }
}

fn library(id: u64, name: &str, scope: &str) -> LibraryConfig {
    LibraryConfig {
        id,
        name: name.to_string(),
        scope: scope.to_string(),
    }
}

/// Users: alice `books:admin`, bob `books:regular`, root `superuser`,
/// carol (inactive) `books:admin`. Libraries: 1 `books`, 2 `other`.
pub fn config(tokens: TokenConfig) -> Config {
    let hasher = hasher();
    Config {
        tokens,
        users: vec![
            user(&hasher, 1, "alice", "books:admin", true),
            user(&hasher, 2, "bob", "books:regular", true),
            user(&hasher, 3, "root", "superuser", true),
            user(&hasher, 4, "carol", "books:admin", false),
        ],
        libraries: vec![library(1, "Books", "books"), library(2, "Other", "other")],
        ..Config::default()
    }
}

pub fn app_with(tokens: TokenConfig) -> TestApp {
    let config = config(tokens);
    let state = Arc::new(AppState::from_config(&config, Arc::new(hasher())).unwrap());
    TestApp {
        router: create_router(Arc::clone(&state), config.server.max_body_size),
        state,
    }
}

pub fn app() -> TestApp {
    app_with(TokenConfig::default())
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Reply {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        Reply {
            status,
            headers,
            body,
        }
    }

    /// `POST /token` with a form-encoded body.
    pub async fn token_form(&self, form: &str) -> Reply {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/token")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form.to_string()))
            .unwrap();
        self.send(request).await
    }

    /// Password grant that must succeed.
    pub async fn login(&self, username: &str) -> TokenResponse {
        let reply = self
            .token_form(&format!(
                "grant_type=password&username={username}&password=correct+horse"
            ))
            .await;
        assert_eq!(reply.status, StatusCode::OK, "login failed: {}", reply.body);
        serde_json::from_value(reply.body).unwrap()
    }

    /// Request with an optional bearer token and optional JSON body.
    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Reply {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).unwrap()).await
    }
}
