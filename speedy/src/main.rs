use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use speedy_client::{ClientConfig, StreamingClient};
use speedy_core::{
    logging,
    tls::{load_server_config, PemFileProvider},
    Config, VERSION,
};
use speedy_relay::{RelayConfig, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "speedy", version)]
#[command(about = "HTTP/2 streaming publish/subscribe relay", long_about = None)]
struct Cli {
    /// Configuration file, SPEEDY_* environment variables override it
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server
    Serve {
        /// Listen address, overrides SPEEDY_BIND_ADDR
        #[arg(long)]
        bind_addr: Option<String>,
    },
    /// Stream newline-delimited messages to the relay
    Publish {
        /// Relay URL, overrides SPEEDY_ENDPOINT
        #[arg(long)]
        endpoint: Option<String>,

        /// Read messages from this file instead of stdin
        #[arg(long, short)]
        file: Option<PathBuf>,
    },
    /// Print messages from the relay as they arrive
    Subscribe {
        /// Relay URL, overrides SPEEDY_ENDPOINT
        #[arg(long)]
        endpoint: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // 1. Load configuration
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    match &cli.command {
        Command::Serve {
            bind_addr: Some(addr),
        } => config.bind_addr.clone_from(addr),
        Command::Publish {
            endpoint: Some(endpoint),
            ..
        }
        | Command::Subscribe {
            endpoint: Some(endpoint),
        } => config.endpoint.clone_from(endpoint),
        _ => {}
    }

    // 2. Validate (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        anyhow::bail!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        );
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging())?;

    match cli.command {
        Command::Serve { .. } => serve(&config).await,
        Command::Publish { file, .. } => publish(&config, file).await,
        Command::Subscribe { .. } => subscribe(&config).await,
    }
}

async fn serve(config: &Config) -> Result<()> {
    info!("speedy {} relay starting...", VERSION);

    let tls = load_server_config(&PemFileProvider::from(&config.tls()))
        .context("Failed to load TLS credential")?;
    let span = tracing::info_span!("relay");

    let relay = RelayServer::new(RelayConfig::from(config), tls, span)?
        .listen()
        .await?;
    info!("Relay reachable at {}", relay.url());

    relay.serve().await?;
    info!("Relay shut down cleanly");
    Ok(())
}

async fn publish(config: &Config, file: Option<PathBuf>) -> Result<()> {
    let client = StreamingClient::new(ClientConfig::try_from(config)?)?;

    let receipt = match file {
        Some(path) => {
            let source = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            client.publish(source).await?
        }
        None => client.publish(tokio::io::stdin()).await?,
    };

    info!(bytes_sent = receipt.bytes_sent, "Publish finished");
    print!("{}", receipt.body);
    Ok(())
}

async fn subscribe(config: &Config) -> Result<()> {
    let client = StreamingClient::new(ClientConfig::try_from(config)?)?;

    let mut stdout = tokio::io::stdout();
    let summary = client.subscribe(&mut stdout).await?;

    info!(
        messages = summary.messages,
        bytes = summary.bytes,
        "Relay closed the stream"
    );
    Ok(())
}
