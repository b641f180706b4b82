//! Application configuration

pub mod profile;

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;

pub use profile::RelayProfile;

/// Process-wide settings, read once at startup and never mutated afterwards
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// How many consecutive ports to try when the configured one is taken
    pub port_attempts: u16,
    pub upstream_url: Option<String>,
    pub api_key: Option<String>,
    pub static_dir: PathBuf,
    pub data_dir: Option<PathBuf>,
    pub request_timeout: Duration,
    pub profile: RelayProfile,
}

/// Validated upstream connection settings
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub url: Url,
    pub api_key: String,
    pub timeout: Duration,
}

/// Reasons the chat route cannot talk to the upstream
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set; chat is unavailable until it is configured")]
    Missing(&'static str),

    #[error("MOXIE_UPSTREAM_URL is not a valid http(s) URL: {0}")]
    InvalidUrl(String),
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let profile = match env::var("MOXIE_PROFILE") {
            Ok(path) => RelayProfile::from_file(&PathBuf::from(path))?,
            Err(_) => RelayProfile::default(),
        };

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            port_attempts: env::var("MOXIE_PORT_ATTEMPTS")
                .ok()
                .and_then(|n| n.parse().ok())
                .unwrap_or(1)
                .max(1),
            upstream_url: non_empty_var("MOXIE_UPSTREAM_URL"),
            api_key: non_empty_var("MOXIE_API_KEY"),
            static_dir: env::var("MOXIE_STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./public")),
            data_dir: env::var("MOXIE_DATA_DIR").ok().map(PathBuf::from),
            request_timeout: Duration::from_secs(
                env::var("MOXIE_REQUEST_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(120),
            ),
            profile,
        })
    }

    /// Validate the upstream endpoint and credential
    pub fn upstream(&self) -> Result<UpstreamSettings, ConfigError> {
        let raw = self
            .upstream_url
            .as_deref()
            .ok_or(ConfigError::Missing("MOXIE_UPSTREAM_URL"))?;
        let api_key = self
            .api_key
            .clone()
            .ok_or(ConfigError::Missing("MOXIE_API_KEY"))?;

        let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", raw, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(format!(
                "{}: unsupported scheme '{}'",
                raw,
                url.scheme()
            )));
        }

        Ok(UpstreamSettings {
            url,
            api_key,
            timeout: self.request_timeout,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            port_attempts: 1,
            upstream_url: None,
            api_key: None,
            static_dir: PathBuf::from("./public"),
            data_dir: None,
            request_timeout: Duration::from_secs(120),
            profile: RelayProfile::default(),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
