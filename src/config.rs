//! Configuration loading and types for driveferry.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: transfer tuning, OAuth client identity, credential
//! persistence, and logging.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Transfer engine settings.
    #[serde(default)]
    pub transfer: TransferConfig,

    /// OAuth client settings.
    #[serde(default)]
    pub oauth: OAuthConfig,

    /// Credential store settings.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Transfer engine tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Upload chunk size in bytes.  One chunk is committed per range PUT.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Number of parallel segment fetches per chunk.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Remote directory uploads land under (e.g. `/driveferry`).
    #[serde(default = "default_remote_root")]
    pub remote_root: String,

    /// Per-request network timeout in seconds.  Expiry is classified as
    /// a transient failure and retried.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            concurrency: default_concurrency(),
            remote_root: default_remote_root(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// OAuth client identity and endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// Application (client) id.
    #[serde(default)]
    pub client_id: String,

    /// Application client secret.
    #[serde(default)]
    pub client_secret: String,

    /// Redirect URI registered with the authorization server.
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,

    /// Authorization endpoint.
    #[serde(default = "default_auth_url")]
    pub auth_url: String,

    /// Token endpoint.
    #[serde(default = "default_token_url")]
    pub token_url: String,

    /// Requested scopes.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: default_redirect_uri(),
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            scopes: default_scopes(),
        }
    }
}

/// Credential store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    /// Path to the SQLite database file holding account records.
    #[serde(default = "default_credentials_path")]
    pub path: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            path: default_credentials_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_chunk_size() -> u64 {
    // Must be a multiple of 320 KiB per the upload session contract;
    // 10 fragments of 320 KiB = 3,276,800 bytes.
    3_276_800
}

fn default_concurrency() -> usize {
    5
}

fn default_remote_root() -> String {
    "/driveferry".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_redirect_uri() -> String {
    "http://localhost:8080/auth".to_string()
}

fn default_auth_url() -> String {
    "https://login.microsoftonline.com/common/oauth2/v2.0/authorize".to_string()
}

fn default_token_url() -> String {
    "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["offline_access".to_string(), "Files.ReadWrite".to_string()]
}

fn default_credentials_path() -> String {
    "./data/credentials.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.transfer.chunk_size, 3_276_800);
        assert_eq!(config.transfer.concurrency, 5);
        assert_eq!(config.transfer.remote_root, "/driveferry");
        assert_eq!(config.credentials.path, "./data/credentials.db");
        assert_eq!(config.logging.level, "info");
        assert_eq!(
            config.oauth.scopes,
            vec!["offline_access".to_string(), "Files.ReadWrite".to_string()]
        );
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let yaml = "
transfer:
  chunk_size: 1048576
  concurrency: 3
oauth:
  client_id: abc
  client_secret: xyz
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.transfer.chunk_size, 1_048_576);
        assert_eq!(config.transfer.concurrency, 3);
        assert_eq!(config.oauth.client_id, "abc");
        // Untouched sections keep their defaults.
        assert_eq!(config.transfer.remote_root, "/driveferry");
        assert!(config.oauth.token_url.contains("oauth2/v2.0/token"));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driveferry.yaml");
        std::fs::write(&path, "transfer:\n  concurrency: 8\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.transfer.concurrency, 8);
    }
}
