//! # upptalk
//!
//! Command-line client: connect, optionally log in, then send one request,
//! run one action, or print inbound traffic until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use upptalk::Client;
use upptalk::rpc::{ActionInput, ConnectionEvent};
use upptalk_core::encode;

/// UppTalk client.
#[derive(Parser, Debug)]
#[command(name = "upptalk", about = "UppTalk command-line client")]
struct Cli {
    /// Settings file (JSON). Falls back to `$UPPTALK_SETTINGS`.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Log in with this account before running the command.
    #[arg(long, requires = "password")]
    username: Option<String>,

    /// Password for `--username`.
    #[arg(long, requires = "username")]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a request and print its result.
    Request {
        /// Method name.
        method: String,
        /// JSON payload.
        #[arg(long)]
        payload: Option<String>,
    },
    /// Run a named action and print its result.
    Perform {
        /// Action name (`upload`, `chat`, `profile`, `call`, ...).
        action: String,
        /// JSON payload.
        #[arg(long)]
        payload: Option<String>,
        /// File sent as the action's attachment.
        #[arg(long)]
        attachment: Option<PathBuf>,
    },
    /// Print inbound messages until interrupted.
    Listen,
}

fn parse_payload(raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(|text| serde_json::from_str(text).context("payload is not valid JSON"))
        .transpose()
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn listen(client: &Client) -> Result<()> {
    let mut events = client.subscribe();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            signal = &mut shutdown => {
                signal.context("Failed to listen for ctrl-c")?;
                break;
            }
            event = events.recv() => match event {
                Ok(ConnectionEvent::Message(message)) => println!("{}", encode(&message)?),
                Ok(ConnectionEvent::Close(reason)) => bail!("connection closed: {reason:?}"),
                Ok(ConnectionEvent::Error(error)) => tracing::warn!(%error, "transport error"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    if args.json_logs {
        upptalk_core::logging::init_json_subscriber(&args.log_level);
    } else {
        upptalk_core::logging::init_subscriber(&args.log_level);
    }

    let settings = match &args.settings {
        Some(path) => upptalk_settings::load_settings_from_path(path),
        None => upptalk_settings::load_settings(),
    }
    .context("Failed to load settings")?;

    let client = Client::new(&settings, None).context("Failed to build client")?;
    client.connect().await.context("Failed to connect")?;

    if let (Some(username), Some(password)) = (&args.username, &args.password) {
        let _ = client
            .authenticate(username, password)
            .await
            .context("Authentication failed")?;
        tracing::info!(%username, "authenticated");
    }

    let outcome = match args.command {
        Command::Request { method, payload } => {
            let payload = parse_payload(payload.as_deref())?;
            let result = client
                .request(&method, payload)
                .await
                .with_context(|| format!("{method} failed"))?;
            print_json(&result)
        }
        Command::Perform {
            action,
            payload,
            attachment,
        } => {
            let mut input = ActionInput {
                payload: parse_payload(payload.as_deref())?,
                ..ActionInput::default()
            };
            if let Some(path) = attachment {
                let body = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                input = input.with_attachment(body);
            }
            let result = client
                .perform(&action, input)
                .await
                .with_context(|| format!("{action} failed"))?;
            print_json(&result)
        }
        Command::Listen => listen(&client).await,
    };

    tracing::info!("Shutting down...");
    client.close();
    outcome
}
