mod bridge;
mod config;
mod db;
mod decoder;
mod discovery;
mod error;
mod link;
mod logging;
mod mesh;
mod model;
mod mqtt;
mod packet;
mod registry;
mod router;
mod sensors;
mod state;
mod timers;
mod topics;
mod web;

use anyhow::Result;
use std::{env, time::Duration};
use tracing::{error, info};

use bridge::Bridge;
use db::Db;
use link::ReconnectPolicy;
use logging::LogControl;
use mesh::MeshManager;
use mqtt::MqttManager;

const MQTT_RECONNECT: Duration = Duration::from_secs(5);
const NAME_REFRESH: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    let log = LogControl::init(&cfg.log_level)?;
    info!(path = %config_path, "config loaded");

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.db_url).await?;
    db.migrate().await?;
    let snapshot = db.load_snapshot().await?;
    info!(nodes = snapshot.nodes.len(), "db ready");

    // ── Bridge core ─────────────────────────────────────────────────
    let mesh_address = cfg.mesh.address.clone();
    let mesh_policy = ReconnectPolicy::fixed(cfg.mesh.reconnect_delay());
    let web_port = cfg.web.port;

    let (bridge, ch) = Bridge::new(cfg.clone(), Some(config_path), log);
    bridge.restore(snapshot).await;
    config::apply(&cfg, &bridge).await?;
    // Retained binary states may be stale after a restart.
    bridge.reset_binary_states().await;
    bridge.activity().write().await.record_system("bridge started");

    // ── Persistence ─────────────────────────────────────────────────
    let writer = tokio::spawn(db::run_writer(db.clone(), ch.snapshots));

    // ── Web server ──────────────────────────────────────────────────
    let web_bridge = bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_bridge, web_port).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── Transports ──────────────────────────────────────────────────
    let mesh = MeshManager::new(mesh_address, mesh_policy, ch.mesh_outgoing);
    tokio::spawn(mesh.run(bridge.clone()));

    let mqtt = MqttManager::new(
        ch.settings,
        ch.outbox,
        bridge.mqtt_link().clone(),
        ReconnectPolicy::fixed(MQTT_RECONNECT),
    );
    tokio::spawn(mqtt.run(bridge.clone()));

    tokio::spawn(bridge.clone().run_name_refresher(NAME_REFRESH));

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    writer.abort();
    let snapshot = bridge.shutdown().await;
    db.save_snapshot(&snapshot).await?;
    info!(nodes = snapshot.nodes.len(), "state saved");

    Ok(())
}
