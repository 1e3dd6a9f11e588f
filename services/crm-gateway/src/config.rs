//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Secrets (cipher key, key hash salt, OAuth client secret) are never read
//! from the TOML itself: each comes from an env var or a `*_file` path.
//! Outside development a missing secret is fatal; in development a random
//! stand-in is generated with a warning.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use crm_auth::SecretCipher;
use operations::HttpOperationSpec;
use serde::Deserialize;
use tracing::warn;

pub const CIPHER_KEY_ENV: &str = "GATEWAY_CIPHER_KEY";
pub const KEY_SALT_ENV: &str = "GATEWAY_KEY_SALT";
pub const CLIENT_SECRET_ENV: &str = "OAUTH_CLIENT_SECRET";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub operations: Vec<HttpOperationSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Where to find secrets when their env vars are unset.
#[derive(Debug, Default, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub cipher_key_file: Option<PathBuf>,
    #[serde(default)]
    pub key_salt_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_oauth_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub rate_window_secs: u64,
    pub rate_max_requests: u64,
    pub refresh_buffer_secs: u64,
    pub refresh_lease_timeout_secs: u64,
    pub oauth_state_ttl_secs: u64,
    pub oauth_max_pending_states: usize,
    pub background_refresh_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_window_secs: 60,
            rate_max_requests: 100,
            refresh_buffer_secs: crm_auth::DEFAULT_REFRESH_BUFFER_SECS,
            refresh_lease_timeout_secs: 30,
            oauth_state_ttl_secs: crm_auth::DEFAULT_STATE_TTL_SECS,
            oauth_max_pending_states: crm_auth::DEFAULT_MAX_PENDING_STATES,
            background_refresh_interval_secs: 60,
        }
    }
}

impl LimitsConfig {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.refresh_buffer_secs)
    }

    pub fn refresh_lease_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_lease_timeout_secs)
    }

    pub fn oauth_state_ttl(&self) -> Duration {
        Duration::from_secs(self.oauth_state_ttl_secs)
    }

    pub fn background_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.background_refresh_interval_secs)
    }
}

#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

/// Secrets resolved from env vars or files, ready for wiring.
#[derive(Debug)]
pub struct Secrets {
    pub cipher_key: Secret<String>,
    pub key_salt: Secret<String>,
    pub oauth_client_secret: Secret<String>,
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    1000
}

fn default_database_path() -> PathBuf {
    PathBuf::from("crm-gateway.db")
}

fn default_oauth_timeout() -> u64 {
    30
}

fn default_upstream_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> common::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        for (field, url) in [
            ("oauth.redirect_uri", &self.oauth.redirect_uri),
            ("oauth.authorize_url", &self.oauth.authorize_url),
            ("oauth.token_url", &self.oauth.token_url),
            ("upstream.base_url", &self.upstream.base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{field} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.oauth.client_id.trim().is_empty() {
            return Err(common::Error::Config("oauth.client_id must not be empty".into()));
        }

        if self.server.listen_addr == self.server.admin_addr {
            return Err(common::Error::Config(
                "server.admin_addr must differ from server.listen_addr".into(),
            ));
        }

        for (field, value) in [
            ("server.max_connections", self.server.max_connections as u64),
            ("oauth.timeout_secs", self.oauth.timeout_secs),
            ("upstream.timeout_secs", self.upstream.timeout_secs),
            ("limits.rate_window_secs", self.limits.rate_window_secs),
            ("limits.rate_max_requests", self.limits.rate_max_requests),
            (
                "limits.refresh_lease_timeout_secs",
                self.limits.refresh_lease_timeout_secs,
            ),
            ("limits.oauth_state_ttl_secs", self.limits.oauth_state_ttl_secs),
            (
                "limits.oauth_max_pending_states",
                self.limits.oauth_max_pending_states as u64,
            ),
            (
                "limits.background_refresh_interval_secs",
                self.limits.background_refresh_interval_secs,
            ),
        ] {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{field} must be greater than 0"
                )));
            }
        }

        Ok(())
    }

    /// Resolve every secret. Env vars take precedence over files.
    pub fn secrets(&self) -> common::Result<Secrets> {
        let env = self.server.environment;
        Ok(Secrets {
            cipher_key: resolve_secret(CIPHER_KEY_ENV, self.security.cipher_key_file.as_deref(), env)?,
            key_salt: resolve_secret(KEY_SALT_ENV, self.security.key_salt_file.as_deref(), env)?,
            oauth_client_secret: resolve_secret(
                CLIENT_SECRET_ENV,
                self.oauth.client_secret_file.as_deref(),
                env,
            )?,
        })
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("crm-gateway.toml")
    }
}

fn resolve_secret(
    var: &'static str,
    file: Option<&Path>,
    environment: Environment,
) -> common::Result<Secret<String>> {
    if let Ok(value) = std::env::var(var) {
        let value = value.trim().to_owned();
        if !value.is_empty() {
            return Ok(Secret::new(value));
        }
    }

    if let Some(file) = file {
        let value = std::fs::read_to_string(file).map_err(|e| {
            common::Error::Config(format!("failed to read {} for {var}: {e}", file.display()))
        })?;
        let value = value.trim().to_owned();
        if !value.is_empty() {
            return Ok(Secret::new(value));
        }
    }

    match environment {
        Environment::Development => {
            warn!(
                secret = var,
                "secret not configured, generated a random value for this process"
            );
            // Random base64 of 32 bytes: a valid cipher key and a long enough salt.
            Ok(SecretCipher::generate_key())
        }
        Environment::Production => Err(common::Error::MissingSecret(var)),
    }
}
