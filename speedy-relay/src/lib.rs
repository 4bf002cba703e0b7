//! HTTP/2 streaming publish/subscribe relay
//!
//! Publishers stream newline-delimited messages into `POST /`, subscribers
//! receive them on the open response body of `GET /`. Messages pass through a
//! single bounded [`speedy_core::MessageBus`], each one going to exactly one
//! subscriber.

pub mod address;
pub mod config;
mod engine;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod server;

pub use address::advertised_url;
pub use config::RelayConfig;
pub use error::{RelayError, RelayResult, ShutdownError, ShutdownFailure};
pub use metrics::RelayMetrics;
pub use server::{shutdown_signal, ListeningRelay, RelayHandle, RelayServer, RelayState};
