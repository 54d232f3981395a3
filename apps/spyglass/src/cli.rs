use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::protocol::{self, events, Frame};

#[derive(Parser, Debug)]
#[command(name = "spyglass")]
#[command(about = "Spyglass assist hub and watch client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Attach to a live session as an agent and print relayed events
    Watch {
        /// Hub URL (e.g., ws://localhost:9001)
        #[arg(short, long, default_value = "ws://localhost:9001")]
        url: String,

        /// Peer id of the session to watch (projectKey:sessionId)
        #[arg(short, long)]
        peer: String,

        /// Agent display name announced to the room
        #[arg(short, long, default_value = "spyglass-cli")]
        name: String,

        /// Shared-secret connect token, when the hub requires one
        #[arg(short, long)]
        token: Option<String>,
    },
}

pub async fn run_watch_client(
    url: String,
    peer: String,
    name: String,
    token: Option<String>,
) -> Result<()> {
    let agent_info = json!({
        "id": protocol::generate_connection_id(),
        "name": name,
    });
    let mut ws_url = format!(
        "{}/ws?peerId={}&identity=agent&agentInfo={}",
        url.trim_end_matches('/'),
        urlencode(&peer),
        urlencode(&agent_info.to_string()),
    );
    if let Some(token) = token {
        ws_url.push_str("&token=");
        ws_url.push_str(&urlencode(&token));
    }

    debug!("connecting to {ws_url}");
    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            error!("failed to connect to {url}: {err}");
            return Err(anyhow::anyhow!("connection failed: {err}"));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "connection timeout - is the hub running at {url}?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    println!("watching {peer} (ctrl-c to stop)");
    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => match serde_json::from_str::<Frame>(&text) {
                Ok(frame) => print_frame(&frame),
                Err(err) => debug!(%err, "unparseable frame: {text}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    write.send(Message::Close(None)).await.ok();
    Ok(())
}

fn print_frame(frame: &Frame) {
    match frame.event.as_str() {
        events::NO_SESSIONS => println!("· no live session in this room yet"),
        events::NO_AGENTS => println!("· all agents left"),
        events::SESSION_RECONNECTED => println!("· session reconnected: {}", frame.payload),
        events::NEW_AGENT => println!("· another agent joined: {}", frame.payload),
        events::AGENT_DISCONNECT => println!("· agent left: {}", frame.payload),
        events::UPDATE_EVENT => println!("update {}", frame.payload),
        events::ERROR => println!("! hub error: {}", frame.payload),
        other => println!("{other} {}", frame.payload),
    }
}

/// Minimal percent-encoding for query string values; peer ids and
/// JSON-encoded bags both travel through here.
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
