use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Prefix shared by every environment variable (`SPEEDY_BIND_ADDR`, ...).
pub const ENV_PREFIX: &str = "SPEEDY";

const LOG_FORMATS: [&str; 3] = ["pretty", "json", "compact"];
const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "warning", "error"];

/// Application configuration
///
/// Keys are flat so that each one maps onto a single environment variable,
/// e.g. `tls_cert_path` is read from `SPEEDY_TLS_CERT_PATH`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay listen address; a missing host means all interfaces (`:8765`).
    pub bind_addr: String,
    /// Relay URL used by the publish/subscribe clients.
    pub endpoint: String,
    pub tls_cert_path: String,
    pub tls_key_path: String,
    /// Skip server certificate validation on the client side.
    pub insecure_skip_verify: bool,
    pub bus_capacity: usize,
    pub shutdown_timeout_secs: u64,
    pub read_header_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub log_level: String,
    pub log_format: String, // "pretty", "json" or "compact"
    pub log_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: ":8765".to_string(),
            endpoint: "https://localhost:8765/".to_string(),
            tls_cert_path: String::new(),
            tls_key_path: String::new(),
            insecure_skip_verify: false,
            bus_capacity: 8,
            shutdown_timeout_secs: 10,
            read_header_timeout_secs: 30,
            idle_timeout_secs: 300,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            log_file: None,
        }
    }
}

/// Certificate/key file pair handed to the certificate provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        Self::load_with_env(config_file, Environment::with_prefix(ENV_PREFIX))
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    fn load_with_env(config_file: Option<&str>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if !Path::new(path).exists() {
                return Err(ConfigError::NotFound(path.to_string()));
            }
            builder = builder.add_source(File::with_name(path));
        }

        // SPEEDY_BIND_ADDR, SPEEDY_TLS_CERT_PATH, ...
        builder = builder.add_source(env.prefix_separator("_").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    /// Check the configuration, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.tls_cert_path.trim().is_empty() {
            errors.push("tls_cert_path is required (SPEEDY_TLS_CERT_PATH)".to_string());
        }
        if self.tls_key_path.trim().is_empty() {
            errors.push("tls_key_path is required (SPEEDY_TLS_KEY_PATH)".to_string());
        }
        if self.bus_capacity == 0 {
            errors.push("bus_capacity must be at least 1".to_string());
        }
        if self.shutdown_timeout_secs == 0 {
            errors.push("shutdown_timeout_secs must be at least 1".to_string());
        }
        if let Err(e) = parse_bind_addr(&self.bind_addr) {
            errors.push(e);
        }
        match url::Url::parse(&self.endpoint) {
            Ok(url) if url.scheme() == "https" => {}
            Ok(url) => errors.push(format!(
                "endpoint must use https, got scheme '{}'",
                url.scheme()
            )),
            Err(e) => errors.push(format!("invalid endpoint '{}': {e}", self.endpoint)),
        }
        if !LOG_FORMATS.contains(&self.log_format.to_lowercase().as_str()) {
            errors.push(format!(
                "log_format must be one of {}, got '{}'",
                LOG_FORMATS.join(", "),
                self.log_format
            ));
        }
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            errors.push(format!("invalid log_level '{}'", self.log_level));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn tls(&self) -> TlsConfig {
        TlsConfig {
            cert_path: self.tls_cert_path.clone(),
            key_path: self.tls_key_path.clone(),
        }
    }

    #[must_use]
    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone(),
            format: self.log_format.clone(),
            file_path: self.log_file.clone(),
        }
    }

    /// Bind address with an empty host expanded to all interfaces
    #[must_use]
    pub fn listen_address(&self) -> String {
        normalize_bind_addr(&self.bind_addr)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    #[must_use]
    pub const fn read_header_timeout(&self) -> Duration {
        Duration::from_secs(self.read_header_timeout_secs)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Expand a host-less bind address (`:8765`) to `0.0.0.0:8765`.
#[must_use]
pub fn normalize_bind_addr(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn parse_bind_addr(addr: &str) -> Result<(), String> {
    let normalized = normalize_bind_addr(addr);
    if normalized.parse::<SocketAddr>().is_ok() {
        return Ok(());
    }
    // Hostnames are resolved at bind time; only the port can be checked here
    match normalized.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(format!("invalid bind_addr '{addr}', expected [host]:port")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: config::Map<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    fn valid_config() -> Config {
        Config {
            tls_cert_path: "cert.pem".to_string(),
            tls_key_path: "key.pem".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.bind_addr, ":8765");
        assert_eq!(config.endpoint, "https://localhost:8765/");
        assert_eq!(config.bus_capacity, 8);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert!(!config.insecure_skip_verify);
    }

    #[test]
    fn test_load_from_environment() {
        let config = Config::load_with_env(
            None,
            env(&[
                ("SPEEDY_BIND_ADDR", "127.0.0.1:9000"),
                ("SPEEDY_TLS_CERT_PATH", "/etc/speedy/cert.pem"),
                ("SPEEDY_TLS_KEY_PATH", "/etc/speedy/key.pem"),
                ("SPEEDY_BUS_CAPACITY", "32"),
                ("SPEEDY_INSECURE_SKIP_VERIFY", "true"),
            ]),
        )
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.tls_cert_path, "/etc/speedy/cert.pem");
        assert_eq!(config.tls_key_path, "/etc/speedy/key.pem");
        assert_eq!(config.bus_capacity, 32);
        assert!(config.insecure_skip_verify);
        // Untouched keys keep their defaults
        assert_eq!(config.endpoint, "https://localhost:8765/");
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "bind_addr = \"127.0.0.1:7000\"").unwrap();
        writeln!(file, "log_level = \"debug\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config =
            Config::load_with_env(Some(&path), env(&[("SPEEDY_BIND_ADDR", ":7100")])).unwrap();

        assert_eq!(config.bind_addr, ":7100");
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let result = Config::load_with_env(Some("/nonexistent/speedy.toml"), env(&[]));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_requires_tls_paths() {
        let errors = Config::default().validate().unwrap_err();

        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("SPEEDY_TLS_CERT_PATH"));
        assert!(errors[1].contains("SPEEDY_TLS_KEY_PATH"));
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_collects_every_error() {
        let config = Config {
            bus_capacity: 0,
            shutdown_timeout_secs: 0,
            bind_addr: "not an address".to_string(),
            endpoint: "http://localhost:8765/".to_string(),
            log_format: "xml".to_string(),
            log_level: "loud".to_string(),
            ..valid_config()
        };

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 6);
        assert!(errors.iter().any(|e| e.contains("https")));
    }

    #[test]
    fn test_normalize_bind_addr() {
        assert_eq!(normalize_bind_addr(":8765"), "0.0.0.0:8765");
        assert_eq!(normalize_bind_addr("127.0.0.1:8765"), "127.0.0.1:8765");
        assert_eq!(normalize_bind_addr("localhost:8765"), "localhost:8765");
        assert!(parse_bind_addr("localhost:8765").is_ok());
        assert!(parse_bind_addr("[::]:8765").is_ok());
        assert!(parse_bind_addr("8765").is_err());
    }

    #[test]
    fn test_typed_views() {
        let config = valid_config();

        assert_eq!(
            config.tls(),
            TlsConfig {
                cert_path: "cert.pem".to_string(),
                key_path: "key.pem".to_string(),
            }
        );
        assert_eq!(config.logging().level, "info");
        assert_eq!(config.listen_address(), "0.0.0.0:8765");
    }
}
