use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};

use engage_proto::{PushEvent, PushEventKind};

#[derive(Parser, Debug)]
#[command(name = "verso-gateway")]
#[command(about = "Verso fanout gateway and debug publisher")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the listen port from the environment/config.
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Publish a test event to a running gateway
    Publish {
        /// Gateway base URL
        #[arg(short, long, default_value = "http://localhost:8080")]
        url: String,

        /// Thread the event belongs to
        #[arg(short, long)]
        thread: String,

        /// Event kind (comment_created, save_changed, ...)
        #[arg(short, long, default_value = "comment_created")]
        kind: String,

        /// Entity the event is about
        #[arg(short, long)]
        entity: String,

        /// Raw JSON payload; defaults to an empty object
        #[arg(long)]
        payload: Option<String>,
    },
}

pub async fn run_publish(
    url: String,
    thread: String,
    kind: String,
    entity: String,
    payload: Option<String>,
) -> Result<()> {
    let kind: PushEventKind = serde_json::from_value(serde_json::Value::String(kind.clone()))
        .map_err(|_| anyhow!("unknown event kind: {}", kind))?;
    let payload = match payload {
        Some(raw) => serde_json::from_str(&raw)?,
        None => serde_json::json!({}),
    };
    let event = PushEvent {
        kind,
        entity_id: entity,
        thread_id: thread,
        payload,
    };

    let response = reqwest::Client::new()
        .post(format!("{}/events", url.trim_end_matches('/')))
        .json(&event)
        .send()
        .await?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    println!("{} {}", status, body);
    if !status.is_success() {
        return Err(anyhow!("publish rejected with status {}", status));
    }
    Ok(())
}
