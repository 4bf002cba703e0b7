pub mod bus;
pub mod config;
pub mod error;
pub mod logging;
pub mod tls;

pub use bus::{BusError, Message, MessageBus};
pub use config::Config;
pub use error::{Error, Result};

/// Version reported at startup and by the CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
