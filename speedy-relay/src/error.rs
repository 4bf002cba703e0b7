use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("could not listen on bind addr {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("listener exited unexpectedly: {0}")]
    Listener(#[source] std::io::Error),

    #[error("shutdown failed: {0}")]
    Shutdown(#[from] ShutdownError),

    #[error("invalid advertised url: {0}")]
    Url(#[from] url::ParseError),

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Core(#[from] speedy_core::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;

/// One thing that went wrong while stopping the relay
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownFailure {
    #[error("deadline exceeded, {remaining} connection(s) forcibly closed")]
    DeadlineExceeded { remaining: usize },

    #[error("HTTP engine: {0}")]
    Engine(String),
}

/// Every failure collected during one shutdown
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct ShutdownError {
    failures: Vec<ShutdownFailure>,
}

impl ShutdownError {
    /// `None` when nothing failed
    #[must_use]
    pub fn from_failures(failures: Vec<ShutdownFailure>) -> Option<Self> {
        if failures.is_empty() {
            None
        } else {
            Some(Self { failures })
        }
    }

    #[must_use]
    pub fn failures(&self) -> &[ShutdownFailure] {
        &self.failures
    }
}

impl From<ShutdownFailure> for ShutdownError {
    fn from(failure: ShutdownFailure) -> Self {
        Self {
            failures: vec![failure],
        }
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred: ", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

/// Handler error rendered as a plain-text HTTP response
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, format!("{}\n", self.message)).into_response()
    }
}

impl From<speedy_core::BusError> for AppError {
    fn from(err: speedy_core::BusError) -> Self {
        match err {
            speedy_core::BusError::Closed => Self::service_unavailable("relay is shutting down"),
            speedy_core::BusError::InvalidMessage => Self::bad_request(err.to_string()),
        }
    }
}
