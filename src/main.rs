//! OpenClaw gateway client CLI.
//!
//! This is the main binary entry point. See the `openclaw_client` library
//! for the core functionality.

use anyhow::{Context, Result};
use mimalloc::MiMalloc;
use openclaw_client::{ClientEvent, Config, Device, GatewayClient};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::time::Duration;
use tokio::sync::broadcast;

/// How long `send` waits for the handshake before giving up.
const CONNECT_WAIT: Duration = Duration::from_secs(30);

// CLI
#[derive(Parser)]
#[command(name = "openclaw-client")]
#[command(version)]
#[command(about = "Client for an OpenClaw agent gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, send one message and print the streamed response
    Send {
        /// Message text
        message: String,
        /// Conversation the message belongs to
        #[arg(long, default_value = "cli")]
        conversation: String,
    },
    /// Print the device identity, creating it if needed
    Identity,
    /// Print the effective configuration
    Config,
}

/// Wait until the handshake completes, failing on the first auth error.
async fn wait_until_connected(
    client: &GatewayClient,
    events: &mut broadcast::Receiver<ClientEvent>,
) -> Result<()> {
    if client.is_connected().await {
        return Ok(());
    }
    let wait = async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::Connected) => return Ok(()),
                // A connection-level error before the handshake completes
                // means the gateway rejected us; retrying won't help the CLI
                Ok(ClientEvent::Error {
                    run_id: None,
                    message,
                }) => anyhow::bail!("{}", message),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    anyhow::bail!("Session ended before the handshake completed")
                }
            }
        }
    };
    tokio::time::timeout(CONNECT_WAIT, wait)
        .await
        .context("Timed out waiting for the gateway handshake")?
}

/// Connect, send one message, stream the response to stdout.
async fn run_send(message: String, conversation: String) -> Result<()> {
    let config = Config::load()?;
    let client = GatewayClient::connect(config)?;
    let mut events = client.subscribe();

    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    tokio::select! {
        result = wait_until_connected(&client, &mut events) => result?,
        _ = stop_rx.recv() => {
            client.disconnect();
            anyhow::bail!("Interrupted");
        }
    }

    // Stream deltas as they arrive; fall back to printing the full text
    // when the response produced no deltas (e.g. streamed before a
    // reconnect)
    let printer = tokio::spawn(async move {
        let mut printed = 0usize;
        loop {
            match events.recv().await {
                Ok(ClientEvent::Delta { delta, .. }) => {
                    print!("{}", delta);
                    let _ = std::io::stdout().flush();
                    printed += delta.len();
                }
                Ok(ClientEvent::Response { text, .. }) => {
                    if printed == 0 {
                        println!("{}", text);
                    } else {
                        println!();
                    }
                    return;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    let result = tokio::select! {
        result = client.send_message(&message, &conversation) => result,
        _ = stop_rx.recv() => {
            printer.abort();
            client.disconnect();
            anyhow::bail!("Interrupted");
        }
    };

    match result {
        Ok(_) => {
            // Give the printer a moment to drain the final events
            let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
            client.disconnect();
            Ok(())
        }
        Err(e) => {
            printer.abort();
            client.disconnect();
            Err(e.into())
        }
    }
}

/// Print the device identity, never the private key.
fn run_identity() -> Result<()> {
    let device = Device::load_or_create()?;
    println!("Device ID:  {}", device.device_id);
    println!("Public key: {}", device.public_key_base64());
    println!(
        "Device token: {}",
        if device.device_token().is_some() {
            "stored"
        } else {
            "none"
        }
    );
    Ok(())
}

/// Print the effective configuration after env overrides.
fn run_config() -> Result<()> {
    let config = Config::load()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Send {
            message,
            conversation,
        } => run_send(message, conversation).await?,
        Commands::Identity => run_identity()?,
        Commands::Config => run_config()?,
    }

    Ok(())
}
