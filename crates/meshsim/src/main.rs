mod sim;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{env, time::Duration};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sim::{MeshSim, Scenario};

/// A text request from the bridge.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    send_text: String,
    #[serde(default)]
    destination_id: Option<String>,
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Env config
    let addr = env::var("SIM_ADDR").unwrap_or_else(|_| "127.0.0.1:4403".to_string());
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let nodes: usize = env::var("SIM_NODES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3);
    let every_ms: u64 = env::var("SIM_EVERY_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(2000);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, %scenario, nodes, every_ms, "mesh simulator listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "bridge connected");
        tokio::spawn(async move {
            let sim = MeshSim::new(scenario, nodes);
            if let Err(e) = serve(stream, sim, Duration::from_millis(every_ms)).await {
                warn!(%peer, "session ended: {e}");
            } else {
                info!(%peer, "bridge disconnected");
            }
        });
    }
}

/// Stream packets to one bridge connection and answer its text requests.
async fn serve(stream: TcpStream, mut sim: MeshSim, every: Duration) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    for line in sim.node_infos() {
        write_line(&mut write, &line).await?;
    }

    let mut tick = interval(every);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let line = sim.next_line(now_unix());
                write_line(&mut write, &line).await?;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                if let Some(reply) = handle_request(&sim, &line) {
                    write_line(&mut write, &reply).await?;
                }
            }
        }
    }
}

/// Log a request; direct messages to a simulated node get an `ack` back.
fn handle_request(sim: &MeshSim, line: &str) -> Option<String> {
    let req: SendRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            warn!(line, "unreadable request: {e}");
            return None;
        }
    };
    match &req.destination_id {
        Some(dest) => {
            info!(to = %dest, text = %req.send_text, "direct text");
            sim.reply(dest, &req.send_text, now_unix())
        }
        None => {
            info!(text = %req.send_text, "broadcast text");
            None
        }
    }
}

async fn write_line(write: &mut tokio::net::tcp::OwnedWriteHalf, line: &str) -> Result<()> {
    write.write_all(line.as_bytes()).await?;
    write.write_all(b"\n").await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
