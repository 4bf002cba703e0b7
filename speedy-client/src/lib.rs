//! Client side of the speedy relay: publish a byte stream, subscribe to one.

pub mod client;
pub mod config;
pub mod error;

pub use client::{PublishReceipt, StreamingClient, SubscribeSummary};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
