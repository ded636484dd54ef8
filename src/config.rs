//! Configuration manager for digitally.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::AppState;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_QUERY_TIMEOUT: u64 = 5;
/// Bounded store and cache calls a single request may chain.
const QUERY_ROUNDS: u32 = 4;
/// Headroom for hashing and response encoding.
const REQUEST_SLACK: Duration = Duration::from_secs(5);
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Public URL of the API.
    pub url: String,
    /// Front-end URL used to build activation links.
    pub frontend_url: String,
    /// Deployment environment.
    pub env: Environment,
    /// Listen address.
    pub address: String,
    /// Upper bound, in seconds, of every store and cache operation.
    pub query_timeout: u64,
    #[serde(skip_deserializing)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to PostgreSQL configuration.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Related to Redis cache configuration.
    #[serde(skip_serializing)]
    pub redis: Option<Redis>,
    /// Related to activation mail sending.
    #[serde(skip_serializing)]
    pub mail: Option<Mail>,
    /// Related to JsonWebToken configuration.
    #[serde(skip_serializing)]
    pub token: Token,
    /// Related to Argon2 configuration.
    #[serde(skip_serializing)]
    pub argon2: Option<Argon2>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_owned(),
            url: "http://localhost:8080/".to_owned(),
            frontend_url: "http://localhost:5173".to_owned(),
            env: Environment::default(),
            address: DEFAULT_ADDRESS.to_owned(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            version: VERSION.to_owned(),
            path: PathBuf::default(),
            postgres: None,
            redis: None,
            mail: None,
            token: Token::default(),
            argon2: None,
        }
    }
}

/// Deployment environment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
    /// Seconds to wait for a free connection.
    pub acquire_timeout: Option<u64>,
}

/// Redis configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Redis {
    pub enabled: bool,
    /// `redis://` URL.
    pub address: String,
    /// Cached identities time-to-live, in seconds.
    pub ttl: u64,
}

impl Default for Redis {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "redis://127.0.0.1:6379".into(),
            ttl: 60 * 10,
        }
    }
}

/// Mailtrap configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Mail {
    pub api_key: String,
    pub inbox_id: String,
    pub from_email: String,
    pub from_name: String,
    /// Invitation validity, in seconds.
    pub invitation_expiry: u64,
    /// Attempts before a notification is considered failed.
    pub max_retries: u32,
    /// Bound of the whole notification step, in seconds.
    pub timeout: u64,
}

impl Default for Mail {
    fn default() -> Self {
        Self {
            api_key: String::default(),
            inbox_id: String::default(),
            from_email: "hello@digitally.local".into(),
            from_name: "Digitally".into(),
            invitation_expiry: 60 * 60 * 24 * 3, // 3 days.
            max_retries: 3,
            timeout: 30,
        }
    }
}

impl Mail {
    /// Bound of one delivery attempt, so that every retry fits in `timeout`.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout) / self.max_retries.max(1)
    }
}

/// Json Web Token configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Token {
    pub secret: String,
    /// Token validity, in seconds.
    pub expiration: u64,
    pub issuer: String,
}

impl Default for Token {
    fn default() -> Self {
        Self {
            secret: String::default(),
            expiration: 60 * 60 * 24 * 3, // 3 days.
            issuer: "digitally".into(),
        }
    }
}

/// Argon2 configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Argon2 {
    /// Memory used while hashing.
    pub memory_cost: u32,
    /// Iterations of hash.
    pub iterations: u32,
    /// Parallelism degree.
    pub parallelism: u32,
    /// Output hash length.
    pub hash_length: usize,
}

impl Default for Argon2 {
    fn default() -> Self {
        Self {
            memory_cost: 1024 * 64, // 64 MiB.
            iterations: 4,
            parallelism: 2,
            hash_length: 32,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Notifications are sandboxed outside production.
    pub fn is_sandbox(&self) -> bool {
        self.env != Environment::Production
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }

    /// Bound of the whole notification step, retries included.
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(
            self.mail
                .as_ref()
                .map(|m| m.timeout)
                .unwrap_or_else(|| Mail::default().timeout),
        )
    }

    /// Deadline of an HTTP request.
    ///
    /// Outlasts the notification step and the store calls around it, so a
    /// failed or timed out delivery is answered after its compensation.
    pub fn request_timeout(&self) -> Duration {
        self.notify_timeout() + self.query_timeout() * QUERY_ROUNDS + REQUEST_SLACK
    }

    /// Reject values the services cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis.as_ref().is_some_and(|redis| redis.ttl == 0) {
            return Err(ConfigError::Invalid("`redis.ttl` must be greater than zero"));
        }
        if self.query_timeout == 0 {
            return Err(ConfigError::Invalid("`query_timeout` must be greater than zero"));
        }

        Ok(())
    }

    pub fn invitation_expiry(&self) -> Duration {
        Duration::from_secs(
            self.mail
                .as_ref()
                .map(|m| m.invitation_expiry)
                .unwrap_or_else(|| Mail::default().invitation_expiry),
        )
    }

    /// Normalizes a URL string by ensuring it starts with a valid scheme
    /// (`http` or `https`).
    fn normalize_url(&self, url: &str) -> Result<String, url::ParseError> {
        let url_with_scheme =
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("https://{url}")
            };

        let parsed_url = Url::parse(&url_with_scheme)?;
        Ok(parsed_url.to_string())
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    pub fn read(self) -> Result<Arc<Self>, ConfigError> {
        let file_path = if self.path.is_file() {
            &self.path
        } else {
            &Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        match File::open(file_path) {
            Ok(file) => {
                let mut config: Configuration =
                    match serde_yaml::from_reader(file) {
                        Ok(config) => config,
                        Err(err) => {
                            return Ok(Arc::new(self.error(err)));
                        },
                    };

                config.validate()?;
                config.version = VERSION.to_owned();
                config.url = self.normalize_url(&config.url)?;
                // activation links are built by appending a path.
                config.frontend_url = self
                    .normalize_url(&config.frontend_url)?
                    .trim_end_matches('/')
                    .to_owned();

                Ok(Arc::new(config))
            },
            Err(err) => Ok(Arc::new(self.error(err))),
        }
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "`config.yaml` file not found or invalid");
        Self::default()
    }
}
