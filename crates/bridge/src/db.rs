use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::model::{
    CommandDefinition, CommandForm, NodeInfo, NodeRecord, SensorDefinition, SensorForm, Snapshot,
    StoredState, ValueKind,
};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

type NodeRow = (String, String, String, i64, bool);
type SensorRow = (String, String, String, String, String, String, i64);
type CommandRow = (String, String, Option<String>, Option<String>, Option<String>);
type StateRow = (String, String, String, i64, i64);

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/mesh-bridge/bridge.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // every in-memory connection is its own database
        let max = if db_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Snapshot save
    // ----------------------------

    /// Replace the stored state with `snap` in one transaction.
    pub async fn save_snapshot(&self, snap: &Snapshot) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin failed")?;

        for table in [
            "sensor_states",
            "command_definitions",
            "sensor_definitions",
            "known_keys",
            "nodes",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("clearing {table} failed"))?;
        }

        for (id, node) in &snap.nodes {
            sqlx::query(
                r#"
                INSERT INTO nodes (id, short_name, long_name, last_heard, enabled)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(&node.info.short_name)
            .bind(&node.info.long_name)
            .bind(node.info.last_heard)
            .bind(node.enabled)
            .execute(&mut *tx)
            .await
            .context("insert node failed")?;

            for key in &node.known_keys {
                sqlx::query("INSERT INTO known_keys (node_id, key) VALUES (?, ?)")
                    .bind(id)
                    .bind(key)
                    .execute(&mut *tx)
                    .await
                    .context("insert known key failed")?;
            }

            for (ordinal, def) in node.sensors.iter().enumerate() {
                let form = SensorForm::from(def.clone());
                let kind = match form.value_type {
                    ValueKind::Numeric => "numeric",
                    ValueKind::Binary => "binary",
                };
                sqlx::query(
                    r#"
                    INSERT INTO sensor_definitions
                      (node_id, name, ordinal, kind, pattern, topic, device_class, delay_off_secs)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(id)
                .bind(&form.name)
                .bind(ordinal as i64)
                .bind(kind)
                .bind(&form.pattern)
                .bind(form.topic.unwrap_or_default())
                .bind(form.device_class.unwrap_or_default())
                .bind(form.delay_off as i64)
                .execute(&mut *tx)
                .await
                .context("insert sensor definition failed")?;
            }

            for (ordinal, def) in node.commands.iter().enumerate() {
                let form = CommandForm::from(def.clone());
                sqlx::query(
                    r#"
                    INSERT INTO command_definitions
                      (node_id, name, ordinal, single_press, on_message, off_message)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(id)
                .bind(&form.name)
                .bind(ordinal as i64)
                .bind(form.single_press)
                .bind(form.on_message)
                .bind(form.off_message)
                .execute(&mut *tx)
                .await
                .context("insert command definition failed")?;
            }

            for (name, state) in &node.states {
                sqlx::query(
                    r#"
                    INSERT INTO sensor_states (node_id, name, value, last_update, delay_off_secs)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(id)
                .bind(name)
                .bind(&state.value)
                .bind(state.last_update)
                .bind(state.delay_off as i64)
                .execute(&mut *tx)
                .await
                .context("insert sensor state failed")?;
            }
        }

        tx.commit().await.context("commit failed")?;
        debug!(nodes = snap.nodes.len(), "snapshot saved");
        Ok(())
    }

    // ----------------------------
    // Snapshot load
    // ----------------------------

    /// Load the stored state. Definitions are validated again on the way
    /// in; rows that no longer validate are skipped with a warning.
    pub async fn load_snapshot(&self) -> Result<Snapshot> {
        let mut snap = Snapshot::default();

        let nodes: Vec<NodeRow> = sqlx::query_as(
            "SELECT id, short_name, long_name, last_heard, enabled FROM nodes ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load nodes failed")?;

        for (id, short_name, long_name, last_heard, enabled) in nodes {
            snap.nodes.insert(
                id,
                NodeRecord {
                    info: NodeInfo {
                        short_name,
                        long_name,
                        last_heard,
                    },
                    enabled,
                    known_keys: Default::default(),
                    sensors: Vec::new(),
                    commands: Vec::new(),
                    states: Default::default(),
                },
            );
        }

        let keys: Vec<(String, String)> =
            sqlx::query_as("SELECT node_id, key FROM known_keys ORDER BY node_id, key")
                .fetch_all(&self.pool)
                .await
                .context("load known keys failed")?;
        for (id, key) in keys {
            if let Some(node) = snap.nodes.get_mut(&id) {
                node.known_keys.insert(key);
            }
        }

        let sensors: Vec<SensorRow> = sqlx::query_as(
            r#"
            SELECT node_id, name, kind, pattern, topic, device_class, delay_off_secs
            FROM sensor_definitions
            ORDER BY node_id, ordinal
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load sensor definitions failed")?;
        for (id, name, kind, pattern, topic, device_class, delay_off) in sensors {
            let form = SensorForm {
                name: name.clone(),
                pattern,
                topic: Some(topic),
                device_class: Some(device_class),
                value_type: if kind == "binary" {
                    ValueKind::Binary
                } else {
                    ValueKind::Numeric
                },
                delay_off: delay_off.max(0) as u64,
            };
            match (snap.nodes.get_mut(&id), SensorDefinition::try_from(form)) {
                (Some(node), Ok(def)) => node.sensors.push(def),
                (None, _) => {}
                (Some(_), Err(e)) => {
                    warn!(node = %id, sensor = %name, error = %e, "skipping stored sensor")
                }
            }
        }

        let commands: Vec<CommandRow> = sqlx::query_as(
            r#"
            SELECT node_id, name, single_press, on_message, off_message
            FROM command_definitions
            ORDER BY node_id, ordinal
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load command definitions failed")?;
        for (id, name, single_press, on_message, off_message) in commands {
            let form = CommandForm {
                name: name.clone(),
                single_press,
                on_message,
                off_message,
            };
            match (snap.nodes.get_mut(&id), CommandDefinition::try_from(form)) {
                (Some(node), Ok(def)) => node.commands.push(def),
                (None, _) => {}
                (Some(_), Err(e)) => {
                    warn!(node = %id, command = %name, error = %e, "skipping stored command")
                }
            }
        }

        let states: Vec<StateRow> = sqlx::query_as(
            "SELECT node_id, name, value, last_update, delay_off_secs FROM sensor_states",
        )
        .fetch_all(&self.pool)
        .await
        .context("load sensor states failed")?;
        for (id, name, value, last_update, delay_off) in states {
            if let Some(node) = snap.nodes.get_mut(&id) {
                node.states.insert(
                    name,
                    StoredState {
                        value,
                        last_update,
                        delay_off: delay_off.max(0) as u64,
                    },
                );
            }
        }

        Ok(snap)
    }
}

/// Persist every snapshot published on `rx`. Bursts coalesce: only the
/// latest snapshot at the time of each write is saved. Returns once the
/// sender is gone, after a final write.
pub async fn run_writer(db: Db, mut rx: watch::Receiver<Snapshot>) {
    while rx.changed().await.is_ok() {
        let snap = rx.borrow_and_update().clone();
        if let Err(e) = db.save_snapshot(&snap).await {
            warn!(error = %format!("{e:#}"), "failed to persist state");
        }
    }
    let snap = rx.borrow().clone();
    if let Err(e) = db.save_snapshot(&snap).await {
        warn!(error = %format!("{e:#}"), "failed to persist final state");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn record() -> NodeRecord {
        NodeRecord {
            info: NodeInfo {
                short_name: "PMP".into(),
                long_name: "Pump house".into(),
                last_heard: 1_700_000_000,
            },
            enabled: true,
            known_keys: ["voltage", "leak", "pump"]
                .into_iter()
                .map(String::from)
                .collect(),
            sensors: vec![
                SensorDefinition::binary("leak", "leak", 30)
                    .unwrap()
                    .with_device_class("moisture"),
                SensorDefinition::numeric("temp", "temp").unwrap(),
            ],
            commands: vec![
                CommandDefinition::toggle("pump", "pump on", "pump off").unwrap(),
                CommandDefinition::single_press("ping", "ping").unwrap(),
            ],
            states: [(
                "leak".to_string(),
                StoredState {
                    value: "ON".into(),
                    last_update: 1_700_000_100,
                    delay_off: 30,
                },
            )]
            .into_iter()
            .collect(),
        }
    }

    // -- snapshot -------------------------------------------------------------

    #[tokio::test]
    async fn empty_db_loads_empty_snapshot() {
        let db = db().await;
        assert_eq!(db.load_snapshot().await.unwrap(), Snapshot::default());
    }

    #[tokio::test]
    async fn snapshot_survives_save_and_load() {
        let db = db().await;
        let mut snap = Snapshot::default();
        snap.nodes.insert("!a1b2c3".into(), record());
        db.save_snapshot(&snap).await.unwrap();

        let back = db.load_snapshot().await.unwrap();
        assert_eq!(back, snap);
        // definition order is kept
        let node = &back.nodes["!a1b2c3"];
        assert_eq!(node.sensors[0].name(), "leak");
        assert_eq!(node.commands[1].name(), "ping");
    }

    #[tokio::test]
    async fn save_replaces_previous_contents() {
        let db = db().await;
        let mut snap = Snapshot::default();
        snap.nodes.insert("!a".into(), record());
        snap.nodes.insert("!b".into(), record());
        db.save_snapshot(&snap).await.unwrap();

        snap.nodes.remove("!a");
        db.save_snapshot(&snap).await.unwrap();

        let back = db.load_snapshot().await.unwrap();
        assert_eq!(back.nodes.keys().collect::<Vec<_>>(), ["!b"]);
    }

    #[tokio::test]
    async fn invalid_stored_definition_is_skipped() {
        let db = db().await;
        let mut snap = Snapshot::default();
        snap.nodes.insert("!a".into(), record());
        db.save_snapshot(&snap).await.unwrap();

        sqlx::query("UPDATE command_definitions SET off_message = on_message WHERE name = 'pump'")
            .execute(&db.pool)
            .await
            .unwrap();

        let back = db.load_snapshot().await.unwrap();
        let names: Vec<&str> = back.nodes["!a"].commands.iter().map(|c| c.name()).collect();
        assert_eq!(names, ["ping"]);
        assert_eq!(back.nodes["!a"].sensors.len(), 2);
    }

    // -- writer ---------------------------------------------------------------

    #[tokio::test]
    async fn writer_persists_latest_snapshot() {
        let db = db().await;
        let (tx, rx) = watch::channel(Snapshot::default());
        let writer = tokio::spawn(run_writer(db.clone(), rx));

        let mut snap = Snapshot::default();
        snap.nodes.insert("!a".into(), record());
        tx.send(snap.clone()).unwrap();
        drop(tx);
        writer.await.unwrap();

        assert_eq!(db.load_snapshot().await.unwrap(), snap);
    }
}
