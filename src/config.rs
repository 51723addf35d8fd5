//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
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
    /// Public domain, optionally with port (e.g., "groups.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://groups.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// URL prefix shared by every local group actor, with trailing slash.
    pub fn group_prefix(&self) -> String {
        format!("{}/group/", self.base_url())
    }

    pub fn group_url(&self, name: &str) -> String {
        format!("{}{}", self.group_prefix(), name)
    }

    pub fn group_inbox_url(&self, name: &str) -> String {
        format!("{}/inbox", self.group_url(name))
    }

    pub fn group_outbox_url(&self, name: &str) -> String {
        format!("{}/outbox", self.group_url(name))
    }

    pub fn group_followers_url(&self, name: &str) -> String {
        format!("{}/followers", self.group_url(name))
    }

    pub fn group_key_id(&self, name: &str) -> String {
        format!("{}#main-key", self.group_url(name))
    }

    pub fn shared_inbox_url(&self) -> String {
        format!("{}/inbox", self.base_url())
    }

    /// `name@domain` handle of a local group
    pub fn group_handle(&self, name: &str) -> String {
        format!("{}@{}", name.to_ascii_lowercase(), self.domain.to_ascii_lowercase())
    }

    /// Extract the group name from a local group actor URL.
    ///
    /// Only the bare actor URL matches (`{base}/group/{name}`, optional
    /// trailing slash); sub-resources such as `/followers` do not.
    pub fn group_name_from_url(&self, url: &str) -> Option<String> {
        let rest = url.strip_prefix(&self.group_prefix())?;
        let name = rest.strip_suffix('/').unwrap_or(rest);
        if name.is_empty() || name.contains('/') || name.contains('#') || name.contains('?') {
            return None;
        }
        Some(name.to_string())
    }

    /// Extract the group name from a local group followers URL.
    pub fn group_name_from_followers_url(&self, url: &str) -> Option<String> {
        let rest = url.strip_prefix(&self.group_prefix())?;
        let name = rest.strip_suffix("/followers")?;
        if name.is_empty() || name.contains('/') {
            return None;
        }
        Some(name.to_string())
    }

    /// Whether a URL points at this instance at all
    pub fn is_local_url(&self, url: &str) -> bool {
        let base = self.base_url();
        url == base || url.starts_with(&format!("{}/", base))
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federation behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Maximum number of ancestors fetched when resolving a reply thread
    pub max_thread_depth: usize,
    /// How far in the past a signed `date` header may be (default: 12h)
    pub signature_max_age_seconds: i64,
    /// Per-call timeout for outbound HTTP requests
    pub http_timeout_seconds: u64,
    /// Maximum concurrent deliveries per broadcast
    pub delivery_concurrency: usize,
    /// TTL for cached remote actor profiles
    pub profile_cache_ttl_seconds: u64,
    /// Permit fetching from / delivering to loopback and private addresses.
    /// Only meant for local development and tests.
    #[serde(default)]
    pub allow_private_networks: bool,
    /// User-Agent for outbound requests
    pub user_agent: String,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            max_thread_depth: 10,
            signature_max_age_seconds: 43_200,
            http_timeout_seconds: 10,
            delivery_concurrency: 10,
            profile_cache_ttl_seconds: 3600,
            allow_private_networks: false,
            user_agent: concat!("Fedigroup/", env!("CARGO_PKG_VERSION")).to_string(),
        }
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

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDIGROUP__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let defaults = FederationConfig::default();
        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 9090)?
            .set_default("server.domain", "localhost:9090")?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/fedigroup.db")?
            .set_default("federation.max_thread_depth", defaults.max_thread_depth as u64)?
            .set_default(
                "federation.signature_max_age_seconds",
                defaults.signature_max_age_seconds,
            )?
            .set_default("federation.http_timeout_seconds", defaults.http_timeout_seconds)?
            .set_default(
                "federation.delivery_concurrency",
                defaults.delivery_concurrency as u64,
            )?
            .set_default(
                "federation.profile_cache_ttl_seconds",
                defaults.profile_cache_ttl_seconds,
            )?
            .set_default("federation.allow_private_networks", false)?
            .set_default("federation.user_agent", defaults.user_agent)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (FEDIGROUP__*)
            .add_source(
                Environment::with_prefix("FEDIGROUP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        let federation = &self.federation;

        if federation.max_thread_depth == 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_thread_depth must be greater than 0".to_string(),
            ));
        }

        if federation.delivery_concurrency == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery_concurrency must be greater than 0".to_string(),
            ));
        }

        if federation.http_timeout_seconds == 0 {
            return Err(crate::error::AppError::Config(
                "federation.http_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if federation.signature_max_age_seconds < 0 {
            return Err(crate::error::AppError::Config(
                "federation.signature_max_age_seconds must not be negative".to_string(),
            ));
        }

        if is_local_server_domain(&self.server.domain) {
            tracing::warn!(
                domain = %self.server.domain,
                protocol = %self.server.protocol,
                "Serving groups from a local domain; remote instances will not reach it"
            );
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        if federation.allow_private_networks {
            tracing::warn!("federation.allow_private_networks is enabled; SSRF guard disabled");
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 9090,
                domain: "localhost:9090".to_string(),
                protocol: "http".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/fedigroup-test.db"),
            },
            federation: FederationConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_http_on_localhost() {
        let config = valid_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_http_for_non_local_domain() {
        let mut config = valid_config();
        config.server.domain = "groups.example.com".to_string();

        let error = config
            .validate()
            .expect_err("public domains must require https");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("server.protocol must be https")
        ));
    }

    #[test]
    fn validate_rejects_zero_thread_depth() {
        let mut config = valid_config();
        config.federation.max_thread_depth = 0;

        let error = config.validate().expect_err("depth 0 must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message) if message.contains("max_thread_depth")
        ));
    }

    #[test]
    fn group_urls_are_derived_from_base_url() {
        let server = valid_config().server;
        assert_eq!(server.group_url("cats"), "http://localhost:9090/group/cats");
        assert_eq!(
            server.group_followers_url("cats"),
            "http://localhost:9090/group/cats/followers"
        );
        assert_eq!(
            server.group_key_id("cats"),
            "http://localhost:9090/group/cats#main-key"
        );
        assert_eq!(server.group_handle("Cats"), "cats@localhost:9090");
    }

    #[test]
    fn group_name_from_url_matches_bare_actor_urls_only() {
        let server = valid_config().server;
        assert_eq!(
            server.group_name_from_url("http://localhost:9090/group/cats"),
            Some("cats".to_string())
        );
        assert_eq!(
            server.group_name_from_url("http://localhost:9090/group/cats/"),
            Some("cats".to_string())
        );
        assert_eq!(
            server.group_name_from_url("http://localhost:9090/group/cats/followers"),
            None
        );
        assert_eq!(
            server.group_name_from_url("https://remote.example/group/cats"),
            None
        );
        assert_eq!(
            server.group_name_from_followers_url("http://localhost:9090/group/cats/followers"),
            Some("cats".to_string())
        );
    }
}
