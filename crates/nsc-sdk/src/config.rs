//! Service configuration.
//!
//! Two layers:
//! - [`RuntimeSettings`]: process environment shared by every service
//!   (`DEFAULT_RESPONSE_TIMEOUT`, `OTEL_AGENT`, `ENVIRONMENT`)
//! - [`ServiceConfig`]: per-service tuning, from defaults, an optional TOML
//!   file and `NSC_` environment overrides

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use nsc_broker::BrokerConfig;
use nsc_proto::settings::{self, DEFAULT_RESPONSE_TIMEOUT, ENVIRONMENT, OTEL_AGENT};
use nsc_proto::DeadlinePolicy;
use serde::Deserialize;
use thiserror::Error;

const LOCAL_ENVIRONMENT: &str = "local";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<nsc_proto::ProtoError> for ConfigError {
    fn from(err: nsc_proto::ProtoError) -> Self {
        Self::Invalid(err.to_string())
    }
}

/// Settings read from the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RuntimeSettings {
    /// Milliseconds.
    #[serde(default)]
    pub default_response_timeout: Option<u64>,

    /// Tracing agent endpoint.
    #[serde(default)]
    pub otel_agent: Option<String>,

    #[serde(default)]
    pub environment: Option<String>,
}

impl RuntimeSettings {
    /// Reads the environment. The historical `DEFAULT_REPONSE_TIMEOUT`
    /// spelling is used when the correct one is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let figment = Figment::new().merge(Env::raw().only(&[
            DEFAULT_RESPONSE_TIMEOUT,
            OTEL_AGENT,
            ENVIRONMENT,
        ]));
        let mut runtime = Self::from_figment(&figment)?;
        if runtime.default_response_timeout.is_none() {
            runtime.default_response_timeout = settings::default_response_timeout_ms()?;
        }
        Ok(runtime)
    }

    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let mut runtime: Self = figment.extract()?;
        runtime.otel_agent = runtime.otel_agent.filter(|v| !v.is_empty());
        runtime.environment = runtime.environment.filter(|v| !v.is_empty());
        Ok(runtime)
    }

    /// Local development disables the orchestration probe.
    pub fn is_local(&self) -> bool {
        self.environment
            .as_deref()
            .is_some_and(|env| env.eq_ignore_ascii_case(LOCAL_ENVIRONMENT))
    }

    pub fn deadline_policy(&self) -> DeadlinePolicy {
        match self.default_response_timeout {
            Some(ms) => DeadlinePolicy::new(Duration::from_millis(ms)),
            None => DeadlinePolicy::without_default(),
        }
    }
}

/// Per-service tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceConfig {
    /// Shared budget for draining every resource at shutdown.
    #[serde(default = "default_graceful_shutdown_timeout_ms")]
    pub graceful_shutdown_timeout_ms: u64,

    /// Port of the `/healthcheck` listener.
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,

    /// Concurrent requests per broker subject; `0` removes the bound.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Bind address of the streaming HTTP listener.
    #[serde(default = "default_http_host")]
    pub http_host: IpAddr,

    #[serde(default = "default_cache_timeout_ms")]
    pub cache_timeout_ms: u64,

    /// Address advertised to clients; detected when unset.
    #[serde(default)]
    pub advertise_ip: Option<IpAddr>,

    #[serde(default)]
    pub broker: BrokerConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            graceful_shutdown_timeout_ms: default_graceful_shutdown_timeout_ms(),
            probe_port: default_probe_port(),
            max_in_flight: default_max_in_flight(),
            http_host: default_http_host(),
            cache_timeout_ms: default_cache_timeout_ms(),
            advertise_ip: None,
            broker: BrokerConfig::default(),
        }
    }
}

const fn default_graceful_shutdown_timeout_ms() -> u64 {
    1_000
}

const fn default_probe_port() -> u16 {
    8081
}

const fn default_max_in_flight() -> usize {
    64
}

fn default_http_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

const fn default_cache_timeout_ms() -> u64 {
    100
}

impl ServiceConfig {
    /// Loads configuration from `path` (if present), then `NSC_` environment
    /// variables. Nested keys use `__`, as in `NSC_BROKER__URL`.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("NSC_").split("__"))
            .extract()
            .map_err(ConfigError::from)
    }

    /// Parses configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Toml::string(content))
            .extract()
            .map_err(ConfigError::from)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }

    pub fn max_in_flight(&self) -> Option<usize> {
        (self.max_in_flight > 0).then_some(self.max_in_flight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = ServiceConfig::parse("").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.graceful_shutdown_timeout(), Duration::from_secs(1));
        assert_eq!(config.probe_port, 8081);
        assert_eq!(config.max_in_flight(), Some(64));
        assert_eq!(config.cache_timeout(), Duration::from_millis(100));
        assert_eq!(config.broker, BrokerConfig::Memory);
    }

    #[test]
    fn zero_in_flight_is_unbounded() {
        let config = ServiceConfig::parse("max_in_flight = 0").unwrap();
        assert_eq!(config.max_in_flight(), None);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
graceful_shutdown_timeout_ms = 250
probe_port = 9000
advertise_ip = "10.0.0.7"

[broker]
backend = "memory"
"#
        )
        .unwrap();

        let config = ServiceConfig::load_from(file.path()).unwrap();
        assert_eq!(config.graceful_shutdown_timeout_ms, 250);
        assert_eq!(config.probe_port, 9000);
        assert_eq!(config.advertise_ip, Some(IpAddr::from([10, 0, 0, 7])));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.http_host, default_http_host());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            ServiceConfig::parse("probe_port = \"eighty\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn runtime_settings_from_figment() {
        let figment = Figment::new().merge(Toml::string(
            "default_response_timeout = 250\nenvironment = \"LOCAL\"\notel_agent = \"\"",
        ));
        let runtime = RuntimeSettings::from_figment(&figment).unwrap();
        assert_eq!(runtime.default_response_timeout, Some(250));
        assert!(runtime.is_local());
        assert_eq!(runtime.otel_agent, None);
        assert_eq!(
            runtime.deadline_policy().default_timeout(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn runtime_without_timeout_has_no_default() {
        let runtime = RuntimeSettings::default();
        assert!(!runtime.is_local());
        assert!(runtime.deadline_policy().require_default().is_err());
    }
}
