use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn tls(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        Self::Tls(format!("{context}: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
