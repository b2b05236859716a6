//! Configuration management

use std::{collections::HashSet, env, path::Path, time::Duration};

use catalog_scope::{Scope, validate_prefix};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "CATALOG_GATE_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Token lifecycle configuration
    pub tokens: TokenConfig,
    /// Users known to the credential verifier
    pub users: Vec<UserConfig>,
    /// Libraries and their scope prefixes
    pub libraries: Vec<LibraryConfig>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must land in the process environment before expansion.
        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} in user password hashes
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for user in &mut self.users {
            user.password_hash = Self::expand_string(&re, &user.password_hash);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Reject configurations the token service cannot honour.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.tokens.validate()?;

        let mut user_ids = HashSet::new();
        let mut usernames = HashSet::new();
        for user in &self.users {
            if user.username.is_empty() {
                return Err(Error::Config(format!("User {} has an empty username", user.id)));
            }
            if !user_ids.insert(user.id) {
                return Err(Error::Config(format!("Duplicate user id: {}", user.id)));
            }
            if !usernames.insert(user.username.as_str()) {
                return Err(Error::Config(format!("Duplicate username: {}", user.username)));
            }
            Scope::parse_strict(&user.scope).map_err(|e| {
                Error::Config(format!("User '{}' has an invalid scope: {e}", user.username))
            })?;
        }

        let mut library_ids = HashSet::new();
        for library in &self.libraries {
            if !library_ids.insert(library.id) {
                return Err(Error::Config(format!("Duplicate library id: {}", library.id)));
            }
            validate_prefix(&library.scope).map_err(|e| {
                Error::Config(format!("Library {} has an invalid scope: {e}", library.id))
            })?;
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 64 * 1024,
        }
    }
}

/// Longest accepted access or refresh token lifetime (ten years).
pub const MAX_TOKEN_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Token lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Access token lifetime
    #[serde(with = "humantime_serde")]
    pub access_ttl: Duration,
    /// Refresh token lifetime (must exceed `access_ttl`)
    #[serde(with = "humantime_serde")]
    pub refresh_ttl: Duration,
    /// Issue a fresh refresh token on every refresh grant
    pub rotate_refresh_tokens: bool,
    /// Attempts at generating a unique token value before giving up
    pub max_generation_attempts: u32,
    /// How often the reaper purges expired tokens
    #[serde(with = "humantime_serde")]
    pub purge_interval: Duration,
    /// How long past expiry a token is kept before purging
    #[serde(with = "humantime_serde")]
    pub purge_grace: Duration,
    /// Password grants allowed per username per minute (0 = unlimited)
    pub login_attempts_per_minute: u32,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_ttl: Duration::from_secs(60 * 60),
            refresh_ttl: Duration::from_secs(14 * 24 * 60 * 60),
            rotate_refresh_tokens: false,
            max_generation_attempts: 3,
            purge_interval: Duration::from_secs(60),
            purge_grace: Duration::from_secs(60 * 60),
            login_attempts_per_minute: 10,
        }
    }
}

impl TokenConfig {
    fn validate(&self) -> Result<()> {
        if self.access_ttl.is_zero() || self.refresh_ttl.is_zero() {
            return Err(Error::Config("Token TTLs must be non-zero".to_string()));
        }
        if self.access_ttl > MAX_TOKEN_TTL || self.refresh_ttl > MAX_TOKEN_TTL {
            return Err(Error::Config(format!(
                "Token TTLs must not exceed {}d",
                MAX_TOKEN_TTL.as_secs() / 86_400
            )));
        }
        if self.refresh_ttl <= self.access_ttl {
            return Err(Error::Config(
                "tokens.refresh_ttl must be longer than tokens.access_ttl".to_string(),
            ));
        }
        if self.max_generation_attempts == 0 {
            return Err(Error::Config(
                "tokens.max_generation_attempts must be at least 1".to_string(),
            ));
        }
        if self.purge_interval.is_zero() {
            return Err(Error::Config("tokens.purge_interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// A user account, as served by the config-backed user directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Stable user id
    pub id: u64,
    /// Login name (unique)
    pub username: String,
    /// Argon2 PHC string (supports `${VAR}`)
    pub password_hash: String,
    /// Space-separated scope grants
    #[serde(default)]
    pub scope: String,
    /// Inactive users cannot obtain or refresh tokens
    #[serde(default = "default_true")]
    pub active: bool,
}

/// A library and its scope prefix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Library id, as it appears in route paths
    pub id: u64,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Scope prefix used in `<prefix>:<role>` grants
    pub scope: String,
}

fn default_true() -> bool {
    true
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "100ms", "30s", "5m", "1h", "14d")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string. A bare number is taken as seconds.
    ///
    /// # Errors
    ///
    /// Returns a message for malformed or out-of-range input.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // "ms" before "s" and "m", or "100ms" would parse as minutes.
        let (digits, unit_ms) = if let Some(ms) = s.strip_suffix("ms") {
            (ms, 1)
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, 1_000)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60 * 1_000)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 60 * 60 * 1_000)
        } else if let Some(days) = s.strip_suffix('d') {
            (days, 24 * 60 * 60 * 1_000)
        } else {
            (s, 1_000)
        };
        let count: u64 = digits
            .parse()
            .map_err(|e| format!("invalid duration '{s}': {e}"))?;
        count
            .checked_mul(unit_ms)
            .map(Duration::from_millis)
            .ok_or_else(|| format!("duration '{s}' is out of range"))
    }
}
