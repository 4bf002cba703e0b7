use std::time::Duration;

use speedy_core::config::TlsConfig;
use speedy_core::Config;
use url::Url;

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Relay URL, both publish and subscribe use its root
    pub endpoint: Url,
    /// Certificate/key pair presented to the relay; the certificate is also
    /// trusted as a root
    pub tls: Option<TlsConfig>,
    /// Skip server certificate validation entirely
    pub insecure_skip_verify: bool,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(endpoint: Url) -> Result<Self, ClientError> {
        if endpoint.scheme() != "https" {
            return Err(ClientError::Config(format!(
                "endpoint '{endpoint}' must use https"
            )));
        }

        Ok(Self {
            endpoint,
            tls: None,
            insecure_skip_verify: false,
            connect_timeout: Duration::from_secs(10),
        })
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub const fn with_insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }
}

impl TryFrom<&Config> for ClientConfig {
    type Error = ClientError;

    fn try_from(config: &Config) -> Result<Self, Self::Error> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| ClientError::Config(format!("invalid endpoint '{}': {e}", config.endpoint)))?;

        let mut client = Self::new(endpoint)?.with_insecure_skip_verify(config.insecure_skip_verify);
        let tls = config.tls();
        if !tls.cert_path.is_empty() && !tls.key_path.is_empty() {
            client = client.with_tls(tls);
        }
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_core_config() {
        let config = Config {
            endpoint: "https://relay.local:9000/".to_string(),
            tls_cert_path: "cert.pem".to_string(),
            tls_key_path: "key.pem".to_string(),
            ..Config::default()
        };

        let client = ClientConfig::try_from(&config).unwrap();

        assert_eq!(client.endpoint.as_str(), "https://relay.local:9000/");
        assert_eq!(client.tls.unwrap().cert_path, "cert.pem");
        assert!(!client.insecure_skip_verify);
    }

    #[test]
    fn test_tls_is_optional() {
        let client = ClientConfig::try_from(&Config::default()).unwrap();
        assert!(client.tls.is_none());
    }

    #[test]
    fn test_rejects_bad_endpoints() {
        for endpoint in ["not a url", "http://localhost:8765/"] {
            let config = Config {
                endpoint: endpoint.to_string(),
                ..Config::default()
            };
            assert!(matches!(
                ClientConfig::try_from(&config),
                Err(ClientError::Config(_))
            ));
        }
    }
}
