//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)
//!
//! The resulting `AppConfig` is threaded explicitly into every component
//! at construction; nothing reads process-wide settings afterwards.

use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

use crate::error::AppError;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub instance: InstanceConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain, optionally with port (e.g., "read.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://read.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// Identifier of the local actor named `username`.
    pub fn actor_id(&self, username: &str) -> String {
        format!("{}/users/{}", self.base_url(), username)
    }

    /// Shared inbox endpoint for every local actor.
    pub fn shared_inbox(&self) -> String {
        format!("{}/inbox", self.base_url())
    }

    /// Human-facing profile URL for `username`.
    pub fn profile_url(&self, username: &str) -> String {
        format!("{}/@{}", self.base_url(), username)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Instance metadata
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// Instance name, advertised in the User-Agent
    pub name: String,
}

/// Federation tuning
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Delay before a detached task runs (default: 2000)
    pub settle_delay_ms: u64,
    /// Per-call timeout for outbound HTTP requests (default: 10)
    pub request_timeout_secs: u64,
    /// Capacity of the detached task queue (default: 256)
    pub queue_capacity: usize,
    /// Detached tasks allowed to run at once (default: 8)
    pub max_concurrent_tasks: usize,
    /// RSA key size used when provisioning local actors (default: 2048)
    pub key_bits: usize,
    /// Scheme used for WebFinger discovery of bare handles (default: "https")
    pub remote_scheme: String,
    /// Accepted clock skew of inbound `Date` headers (default: 300)
    pub signature_max_age_secs: i64,
}

impl FederationConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

const MIN_KEY_BITS: usize = 1024;

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (RUSTREAD__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.domain", "localhost:8080")?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/rustread.db")?
            .set_default("instance.name", "RustRead")?
            .set_default("federation.settle_delay_ms", 2000)?
            .set_default("federation.request_timeout_secs", 10)?
            .set_default("federation.queue_capacity", 256)?
            .set_default("federation.max_concurrent_tasks", 8)?
            .set_default("federation.key_bits", 2048)?
            .set_default("federation.remote_scheme", "https")?
            .set_default("federation.signature_max_age_secs", 300)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("RUSTREAD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Fixed descriptive User-Agent for every outbound request.
    pub fn user_agent(&self) -> String {
        format!(
            "rustread/{} ({}; +{})",
            env!("CARGO_PKG_VERSION"),
            self.instance.name,
            self.server.base_url()
        )
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.server.domain.trim().is_empty() {
            return Err(AppError::Config("server.domain must not be empty".to_string()));
        }

        if !matches!(self.server.protocol.as_str(), "http" | "https") {
            return Err(AppError::Config(format!(
                "server.protocol must be http or https, got {}",
                self.server.protocol
            )));
        }

        if !matches!(self.federation.remote_scheme.as_str(), "http" | "https") {
            return Err(AppError::Config(format!(
                "federation.remote_scheme must be http or https, got {}",
                self.federation.remote_scheme
            )));
        }

        if self.federation.queue_capacity == 0 {
            return Err(AppError::Config(
                "federation.queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.federation.max_concurrent_tasks == 0 {
            return Err(AppError::Config(
                "federation.max_concurrent_tasks must be greater than 0".to_string(),
            ));
        }

        if self.federation.request_timeout_secs == 0 {
            return Err(AppError::Config(
                "federation.request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.federation.key_bits < MIN_KEY_BITS {
            return Err(AppError::Config(format!(
                "federation.key_bits must be at least {}",
                MIN_KEY_BITS
            )));
        }

        if self.federation.signature_max_age_secs <= 0 {
            return Err(AppError::Config(
                "federation.signature_max_age_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
