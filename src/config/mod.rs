//! Handler configuration.
//!
//! Typed sections with defaults for every field, loadable from TOML or JSON
//! and validated before a handler is built.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::modules::proxy::ProxyEndpoint;
use crate::modules::rate_limit::{PacingConfig, RateLimitStrategy};
use crate::outcome::ClassifierConfig;
use crate::transport::TimeoutConfig;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported config format '{0}' (expected .toml or .json)")]
    UnsupportedFormat(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Out-of-band proxy probe settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub url: String,
    pub timeout_secs: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            url: "http://httpbin.org/ip".to_string(),
            timeout_secs: 10.0,
        }
    }
}

impl ProbeConfig {
    pub fn target(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.url)
            .map_err(|err| ConfigError::Invalid(format!("proxy_probe.url '{}': {err}", self.url)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_concurrent: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_concurrent: 3 }
    }
}

pub fn default_headers() -> BTreeMap<String, String> {
    [
        ("User-Agent", DEFAULT_USER_AGENT),
        (
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
        ("Accept-Language", "en-US,en;q=0.5"),
        ("DNT", "1"),
        ("Upgrade-Insecure-Requests", "1"),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .collect()
}

/// Complete handler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    pub strategy: RateLimitStrategy,
    pub pacing: PacingConfig,
    pub timeouts: TimeoutConfig,
    pub session_dir: PathBuf,
    pub stats_path: PathBuf,
    pub default_headers: BTreeMap<String, String>,
    pub proxies: Vec<ProxyEndpoint>,
    pub proxy_probe: ProbeConfig,
    pub classifier: ClassifierConfig,
    pub batch: BatchConfig,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            strategy: RateLimitStrategy::default(),
            pacing: PacingConfig::default(),
            timeouts: TimeoutConfig::default(),
            session_dir: PathBuf::from(".request_handler/sessions"),
            stats_path: PathBuf::from(".request_handler/stats.json"),
            default_headers: default_headers(),
            proxies: Vec::new(),
            proxy_probe: ProbeConfig::default(),
            classifier: ClassifierConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

impl HandlerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: HandlerConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: HandlerConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a `.toml` or `.json` file, chosen by extension.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "toml" => Self::from_toml_str(&contents),
            "json" => Self::from_json_str(&contents),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pacing = &self.pacing;
        let non_negative = [
            ("pacing.min_random_delay", pacing.min_random_delay),
            ("pacing.max_random_delay", pacing.max_random_delay),
            ("pacing.captcha_pause", pacing.captcha_pause),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!("{name} must be >= 0, got {value}")));
            }
        }
        if pacing.min_random_delay > pacing.max_random_delay {
            return Err(ConfigError::Invalid(format!(
                "pacing.min_random_delay ({}) exceeds pacing.max_random_delay ({})",
                pacing.min_random_delay, pacing.max_random_delay
            )));
        }

        let positive = [
            ("timeouts.connect_secs", self.timeouts.connect_secs),
            ("timeouts.total_secs", self.timeouts.total_secs),
            ("proxy_probe.timeout_secs", self.proxy_probe.timeout_secs),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0, got {value}")));
            }
        }
        if self.timeouts.connect_secs > self.timeouts.total_secs {
            return Err(ConfigError::Invalid(
                "timeouts.connect_secs must not exceed timeouts.total_secs".to_string(),
            ));
        }

        if self.batch.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "batch.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.classifier.captcha_indicators.iter().any(|p| p.trim().is_empty())
            || self.classifier.blocking_indicators.iter().any(|p| p.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "classifier indicators must not be empty strings".to_string(),
            ));
        }
        if let Some(proxy) = self.proxies.iter().find(|p| p.host.is_empty() || p.port == 0) {
            return Err(ConfigError::Invalid(format!("proxy '{}' needs a host and port", proxy.key())));
        }

        self.proxy_probe.target()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::proxy::ProxyProtocol;

    #[test]
    fn defaults_match_the_request_handler() {
        let config = HandlerConfig::default();
        assert_eq!(config.strategy, RateLimitStrategy::Conservative);
        assert_eq!(config.timeouts.connect_secs, 10.0);
        assert_eq!(config.timeouts.total_secs, 30.0);
        assert_eq!(config.pacing.captcha_pause, 30.0);
        assert_eq!(config.batch.max_concurrent, 3);
        assert!(config.default_headers.contains_key("User-Agent"));
        assert!(!config.default_headers.contains_key("Accept-Encoding"));
        config.validate().unwrap();
    }

    #[test]
    fn parses_partial_toml() {
        let config = HandlerConfig::from_toml_str(
            r#"
            strategy = "aggressive"
            session_dir = "/tmp/sessions"

            [pacing]
            randomize_intervals = false

            [[proxies]]
            host = "10.0.0.1"
            port = 8080
            protocol = "socks5"

            [classifier]
            captcha_indicators = ["ungewöhnlichen datenverkehr"]
            "#,
        )
        .unwrap();
        assert_eq!(config.strategy, RateLimitStrategy::Aggressive);
        assert!(!config.pacing.randomize_intervals);
        assert_eq!(config.pacing.max_random_delay, 15.0);
        assert_eq!(config.proxies[0].protocol, ProxyProtocol::Socks5);
        assert_eq!(config.classifier.captcha_indicators.len(), 1);
        assert!(!config.classifier.blocking_indicators.is_empty());
    }

    #[test]
    fn rejects_unknown_strategy_and_bad_values() {
        assert!(matches!(
            HandlerConfig::from_json_str(r#"{"strategy": "reckless"}"#),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            HandlerConfig::from_json_str(r#"{"batch": {"max_concurrent": 0}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            HandlerConfig::from_json_str(r#"{"timeouts": {"connect_secs": 60, "total_secs": 30}}"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn load_picks_format_from_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("handler.json");
        tokio::fs::write(&json, r#"{"strategy": "balanced"}"#).await.unwrap();
        assert_eq!(
            HandlerConfig::load(&json).await.unwrap().strategy,
            RateLimitStrategy::Balanced
        );

        let yaml = dir.path().join("handler.yaml");
        tokio::fs::write(&yaml, "strategy: balanced").await.unwrap();
        assert!(matches!(
            HandlerConfig::load(&yaml).await,
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }
}
