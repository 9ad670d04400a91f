//! Configuration for the certM3 middleware.
//!
//! Both binaries load the same YAML file; the gateway reads the
//! `app_server` table, the signer reads `signer`, and the logging keys are
//! shared. Missing keys fall back to the documented defaults, and
//! [`Config::validate`] turns an incomplete signer section into a fatal
//! startup error before any listener opens.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// One of `debug`, `info`, `warn`, `error`.
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Append-only JSON log destination.
    #[serde(default = "defaults::log_file")]
    pub log_file: String,
    /// Fan logs out to stdout in addition to the log file.
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub app_server: AppServerConfig,
    #[serde(default)]
    pub signer: SignerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppServerConfig {
    /// Bind address. A bare `:port` is accepted and treated as all
    /// interfaces.
    #[serde(default = "defaults::listen_addr")]
    pub listen_addr: String,
    /// Base URL of the registry backend.
    #[serde(default = "defaults::backend_api_url")]
    pub backend_api_url: String,
    /// Sliding-window rate limit, per client IP, per second.
    #[serde(default = "defaults::rate_limit_per_ip")]
    pub rate_limit_per_ip: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignerConfig {
    /// Filesystem path of the signer's unix socket.
    #[serde(default)]
    pub socket_path: String,
    #[serde(default)]
    pub ca_cert_path: String,
    #[serde(default)]
    pub ca_key_path: String,
    /// Issued-certificate validity in days.
    #[serde(default)]
    pub cert_validity_days: u32,
    /// Dotted OID under which the authorised group set is embedded.
    #[serde(default)]
    pub role_extension_oid: String,
    #[serde(default)]
    pub subject_ou: String,
    #[serde(default)]
    pub subject_o: String,
    #[serde(default)]
    pub subject_l: String,
    #[serde(default)]
    pub subject_st: String,
    #[serde(default)]
    pub subject_c: String,
    #[serde(default)]
    pub key_usage: Vec<String>,
    #[serde(default)]
    pub extended_key_usage: Vec<String>,
    #[serde(default)]
    pub crl_distribution_url: String,
    #[serde(default)]
    pub aia_issuer_url: String,
}

mod defaults {
    pub fn log_level() -> String {
        "info".to_string()
    }

    pub fn log_file() -> String {
        "/var/log/certM3/mw/app.log".to_string()
    }

    pub fn listen_addr() -> String {
        ":8080".to_string()
    }

    pub fn backend_api_url() -> String {
        "http://localhost:8081".to_string()
    }

    pub fn rate_limit_per_ip() -> u32 {
        100
    }
}

impl Default for AppServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: defaults::listen_addr(),
            backend_api_url: defaults::backend_api_url(),
            rate_limit_per_ip: defaults::rate_limit_per_ip(),
        }
    }
}

impl Config {
    /// Loads the configuration from a YAML file, applying defaults for
    /// absent keys. Call [`Config::validate`] afterwards.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Checks the invariants that must hold before either process starts.
    ///
    /// The signer policy keys are required to be non-empty even when the
    /// minimal certificate template does not consume them; an operator who
    /// has not filled them in has not finished configuring the CA.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.log_level.as_str(), "debug" | "info" | "warn" | "error") {
            return Err(ConfigError::Invalid(format!(
                "invalid log level: {}",
                self.log_level
            )));
        }
        if self.app_server.listen_addr.is_empty() {
            return Err(ConfigError::Invalid("listen_addr is required".into()));
        }
        if self.app_server.backend_api_url.is_empty() {
            return Err(ConfigError::Invalid("backend_api_url is required".into()));
        }

        let signer = &self.signer;
        if signer.socket_path.is_empty() {
            return Err(ConfigError::Invalid("signer.socket_path is required".into()));
        }
        if signer.ca_cert_path.is_empty() {
            return Err(ConfigError::Invalid("signer.ca_cert_path is required".into()));
        }
        if signer.ca_key_path.is_empty() {
            return Err(ConfigError::Invalid("signer.ca_key_path is required".into()));
        }
        if !Path::new(&signer.ca_cert_path).exists() {
            return Err(ConfigError::Invalid(format!(
                "CA certificate not found: {}",
                signer.ca_cert_path
            )));
        }
        if !Path::new(&signer.ca_key_path).exists() {
            return Err(ConfigError::Invalid(format!(
                "CA key not found: {}",
                signer.ca_key_path
            )));
        }
        if signer.cert_validity_days == 0 {
            return Err(ConfigError::Invalid(
                "signer.cert_validity_days must be a positive integer".into(),
            ));
        }
        parse_oid(&signer.role_extension_oid).map_err(|()| {
            ConfigError::Invalid(format!(
                "signer.role_extension_oid is not a valid dotted OID: {:?}",
                signer.role_extension_oid
            ))
        })?;
        for (key, value) in [
            ("signer.subject_ou", &signer.subject_ou),
            ("signer.subject_o", &signer.subject_o),
            ("signer.subject_l", &signer.subject_l),
            ("signer.subject_st", &signer.subject_st),
            ("signer.subject_c", &signer.subject_c),
            ("signer.crl_distribution_url", &signer.crl_distribution_url),
            ("signer.aia_issuer_url", &signer.aia_issuer_url),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Invalid(format!("{key} is required")));
            }
        }
        if signer.key_usage.is_empty() {
            return Err(ConfigError::Invalid("signer.key_usage is required".into()));
        }
        if signer.extended_key_usage.is_empty() {
            return Err(ConfigError::Invalid(
                "signer.extended_key_usage is required".into(),
            ));
        }

        Ok(())
    }
}

impl AppServerConfig {
    /// The bind address in the form `host:port`. A configured `:8080` binds
    /// all interfaces.
    pub fn bind_addr(&self) -> String {
        if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        }
    }
}

/// Checks a dotted OID string: at least two numeric components.
fn parse_oid(oid: &str) -> Result<Vec<u64>, ()> {
    let components: Vec<u64> = oid
        .split('.')
        .map(|part| part.parse::<u64>().map_err(|_| ()))
        .collect::<Result<_, _>>()?;
    if components.len() < 2 {
        return Err(());
    }
    Ok(components)
}
