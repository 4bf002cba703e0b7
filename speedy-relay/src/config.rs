use std::time::Duration;

use speedy_core::bus::DEFAULT_CAPACITY;
use speedy_core::Config;

/// Relay server settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// `host:port`, a host-less `:port` is accepted and means all interfaces
    pub bind_addr: String,
    pub bus_capacity: usize,
    /// Deadline for draining connections once shutdown starts
    pub shutdown_timeout: Duration,
    /// Bound on the TLS handshake and on reading HTTP/1 request headers
    pub read_header_timeout: Duration,
    /// HTTP/2 keep-alive ping interval on otherwise silent connections
    pub idle_timeout: Duration,
}

impl RelayConfig {
    #[must_use]
    pub fn with_bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: ":8765".to_string(),
            bus_capacity: DEFAULT_CAPACITY,
            shutdown_timeout: Duration::from_secs(10),
            read_header_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl From<&Config> for RelayConfig {
    fn from(config: &Config) -> Self {
        Self {
            bind_addr: config.listen_address(),
            bus_capacity: config.bus_capacity,
            shutdown_timeout: config.shutdown_timeout(),
            read_header_timeout: config.read_header_timeout(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_core_config() {
        let config = Config {
            bind_addr: ":9000".to_string(),
            bus_capacity: 16,
            shutdown_timeout_secs: 3,
            ..Config::default()
        };

        let relay = RelayConfig::from(&config);

        assert_eq!(relay.bind_addr, "0.0.0.0:9000");
        assert_eq!(relay.bus_capacity, 16);
        assert_eq!(relay.shutdown_timeout, Duration::from_secs(3));
        assert_eq!(relay.idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_defaults_match_core_defaults() {
        let from_core = RelayConfig::from(&Config::default());
        let default = RelayConfig::default();

        assert_eq!(from_core.bus_capacity, default.bus_capacity);
        assert_eq!(from_core.shutdown_timeout, default.shutdown_timeout);
        assert_eq!(from_core.read_header_timeout, default.read_header_timeout);
    }
}
