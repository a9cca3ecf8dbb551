use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::protocol::ClientMessage;

#[derive(Parser, Debug)]
#[command(name = "cloudvars")]
#[command(about = "Cloud variable relay server and protocol client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Talk to a running relay over its wire protocol
    Client {
        /// Relay WebSocket URL
        #[arg(short, long, default_value = "ws://localhost:9080/ws")]
        url: String,

        /// Project id to handshake with
        #[arg(short, long)]
        project: String,

        #[command(subcommand)]
        command: ClientCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ClientCommands {
    /// Set one variable and exit
    Set {
        name: String,
        /// Parsed as JSON when possible, otherwise sent as a string
        value: String,
    },
    /// Print every notification the project broadcasts
    Watch,
}

pub async fn run_client(url: String, project: String, command: ClientCommands) -> Result<()> {
    let (ws, _) = connect_async(&url)
        .await
        .context("failed to connect to relay")?;
    let (mut write, mut read) = ws.split();

    let handshake = serde_json::to_string(&ClientMessage::Handshake {
        project_id: project,
    })?;
    write.send(Message::Text(handshake.into())).await?;

    match command {
        ClientCommands::Set { name, value } => {
            let value: Value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            let message = serde_json::to_string(&ClientMessage::Set { name, value })?;
            write.send(Message::Text(message.into())).await?;
            write.close().await?;
        }
        ClientCommands::Watch => {
            while let Some(frame) = read.next().await {
                match frame? {
                    Message::Text(text) => {
                        for line in text.lines() {
                            println!("{line}");
                        }
                    }
                    Message::Close(_) => break,
                    other => debug!("ignoring frame: {other:?}"),
                }
            }
        }
    }

    Ok(())
}
