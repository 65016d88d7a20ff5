//! TOML config file loading, validation, environment overrides, and node
//! seeding.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::bridge::Bridge;
use crate::logging;
use crate::model::{CommandDefinition, SensorDefinition};
use crate::topics::{Topics, DEFAULT_DISCOVERY_PREFIX, DEFAULT_PREFIX};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub db_url: String,
    pub mqtt: MqttConfig,
    pub mesh: MeshConfig,
    pub web: WebConfig,
    pub nodes: Vec<NodeSeed>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Empty leaves the bridge offline until a host is configured.
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub topic_prefix: String,
    pub client_id: String,
    pub discovery_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// `host:port` of the mesh endpoint's JSON-lines socket.
    pub address: String,
    pub reconnect_delay_secs: u64,
    pub lookup_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

/// A node to create (and optionally enable) at startup, with its
/// definitions. Definitions already present are left as they are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSeed {
    pub id: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub sensors: Vec<SensorDefinition>,
    #[serde(default)]
    pub commands: Vec<CommandDefinition>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            db_url: "sqlite:mesh_bridge.db?mode=rwc".to_string(),
            mqtt: MqttConfig::default(),
            mesh: MeshConfig::default(),
            web: WebConfig::default(),
            nodes: Vec::new(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: None,
            password: None,
            topic_prefix: DEFAULT_PREFIX.to_string(),
            client_id: "MeshBridge".to_string(),
            discovery_prefix: DEFAULT_DISCOVERY_PREFIX.to_string(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:4403".to_string(),
            reconnect_delay_secs: 5,
            lookup_attempts: 3,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

impl MqttConfig {
    pub fn topics(&self) -> Topics {
        Topics::new(&self.topic_prefix, &self.discovery_prefix)
    }

    /// Every violation in the MQTT settings.
    pub fn problems(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.port == 0 {
            errors.push("mqtt.port must be non-zero".to_string());
        }
        if self.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        }
        for (field, value) in [
            ("mqtt.topic_prefix", &self.topic_prefix),
            ("mqtt.discovery_prefix", &self.discovery_prefix),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("{field} is empty"));
            } else if value.contains(['+', '#']) {
                errors.push(format!("{field} '{value}' contains an MQTT wildcard"));
            } else if value.starts_with('/') || value.ends_with('/') {
                errors.push(format!("{field} '{value}' has a leading or trailing '/'"));
            }
        }
        errors
    }
}

impl MeshConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors = self.mqtt.problems();

        if self.mesh.address.trim().is_empty() {
            errors.push("mesh.address is empty".to_string());
        }
        if self.mesh.lookup_attempts == 0 {
            errors.push("mesh.lookup_attempts must be at least 1".to_string());
        }
        if self.web.port == 0 {
            errors.push("web.port must be non-zero".to_string());
        }
        if logging::directive(&self.log_level).is_none() {
            errors.push(format!("log_level '{}' is not a known level", self.log_level));
        }
        if self.db_url.trim().is_empty() {
            errors.push("db_url is empty".to_string());
        }
        self.validate_nodes(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_nodes(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, n) in self.nodes.iter().enumerate() {
            let ctx = || {
                if n.id.is_empty() {
                    format!("nodes[{i}]")
                } else {
                    format!("node '{}'", n.id)
                }
            };

            if n.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(&n.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }

            // sensor and command names share one namespace per node
            let mut names: HashSet<&str> = HashSet::new();
            let all = n
                .sensors
                .iter()
                .map(SensorDefinition::name)
                .chain(n.commands.iter().map(CommandDefinition::name));
            for name in all {
                if !names.insert(name) {
                    errors.push(format!("{}: duplicate definition name '{name}'", ctx()));
                }
            }
        }
    }

    /// Apply `MQTT_HOST`, `MQTT_PORT`, `DB_URL` and `WEB_PORT`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = var("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = var("MQTT_PORT") {
            self.mqtt.port = port
                .trim()
                .parse()
                .with_context(|| format!("MQTT_PORT '{port}' is not a port number"))?;
        }
        if let Some(url) = var("DB_URL") {
            self.db_url = url;
        }
        if let Some(port) = var("WEB_PORT") {
            self.web.port = port
                .trim()
                .parse()
                .with_context(|| format!("WEB_PORT '{port}' is not a port number"))?;
        }
        Ok(())
    }

    pub async fn save(&self, path: &str) -> Result<()> {
        let text = toml::to_string_pretty(self).context("failed to serialize config")?;
        tokio::fs::write(path, text)
            .await
            .with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, override from the environment, and validate. A missing
/// file yields the defaults.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "no config file; using defaults");
        Config::default()
    };
    config.apply_env(|k| std::env::var(k).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Create every seeded node and its definitions.
pub async fn apply(config: &Config, bridge: &Bridge) -> Result<()> {
    for seed in &config.nodes {
        bridge
            .seed_node(seed)
            .await
            .with_context(|| format!("failed to seed node '{}'", seed.id))?;
    }

    tracing::info!(nodes = config.nodes.len(), "config applied");

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    fn assert_invalid(config: &Config, needle: &str) {
        let err = format!("{:#}", config.validate().unwrap_err());
        assert!(err.contains(needle), "expected '{needle}' in: {err}");
    }

    // -- defaults -------------------------------------------------------------

    #[test]
    fn defaults_are_valid() {
        let c = Config::default();
        c.validate().unwrap();
        assert_eq!(c.mqtt.port, 1883);
        assert_eq!(c.mqtt.topic_prefix, "Mesh/feeds");
        assert_eq!(c.mqtt.client_id, "MeshBridge");
        assert_eq!(c.mesh.address, "127.0.0.1:4403");
        assert_eq!(c.mesh.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(c.web.port, 5000);
    }

    #[test]
    fn empty_file_is_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c, Config::default());
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let c: Config = toml::from_str(
            r#"
            log_level = "DEBUG"
            [mqtt]
            host = "broker.lan"
            username = "ha"
            password = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(c.mqtt.host, "broker.lan");
        assert_eq!(c.mqtt.port, 1883);
        assert_eq!(c.mqtt.username.as_deref(), Some("ha"));
        assert_eq!(c.mesh.lookup_attempts, 3);
        c.validate().unwrap();
    }

    #[test]
    fn missing_file_loads_defaults() {
        let c = load("/nonexistent/mesh-bridge-config.toml").unwrap();
        assert_eq!(c.mqtt.topic_prefix, Config::default().mqtt.topic_prefix);
    }

    // -- validation -----------------------------------------------------------

    #[test]
    fn zero_ports_rejected() {
        let mut c = Config::default();
        c.mqtt.port = 0;
        assert_invalid(&c, "mqtt.port");
        let mut c = Config::default();
        c.web.port = 0;
        assert_invalid(&c, "web.port");
    }

    #[test]
    fn wildcard_prefix_rejected() {
        let mut c = Config::default();
        c.mqtt.topic_prefix = "Mesh/+".into();
        assert_invalid(&c, "wildcard");
    }

    #[test]
    fn slash_edged_prefix_rejected() {
        let mut c = Config::default();
        c.mqtt.topic_prefix = "/Mesh/feeds".into();
        assert_invalid(&c, "leading or trailing");
    }

    #[test]
    fn unknown_log_level_rejected() {
        let mut c = Config::default();
        c.log_level = "LOUD".into();
        assert_invalid(&c, "log_level");
        c.log_level = "warning".into();
        c.validate().unwrap();
    }

    #[test]
    fn zero_lookup_attempts_rejected() {
        let mut c = Config::default();
        c.mesh.lookup_attempts = 0;
        assert_invalid(&c, "lookup_attempts");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut c = Config::default();
        c.mqtt.port = 0;
        c.mesh.address = "".into();
        c.db_url = " ".into();
        let err = format!("{:#}", c.validate().unwrap_err());
        assert!(err.contains("3 errors"), "{err}");
    }

    // -- node seeds -----------------------------------------------------------

    #[test]
    fn node_seeds_parse_and_validate() {
        let c: Config = toml::from_str(
            r#"
            [[nodes]]
            id = "!a1b2c3"
            enabled = true

            [[nodes.sensors]]
            name = "leak"
            pattern = "leak"
            value_type = "binary"
            delay_off = 30
            device_class = "moisture"

            [[nodes.commands]]
            name = "pump"
            on_message = "pump on"
            off_message = "pump off"
            "#,
        )
        .unwrap();
        c.validate().unwrap();
        let n = &c.nodes[0];
        assert!(n.enabled);
        assert!(n.sensors[0].is_binary());
        assert!(n.commands[0].is_toggle());
    }

    #[test]
    fn invalid_seed_definition_fails_to_parse() {
        let res: std::result::Result<Config, _> = toml::from_str(
            r#"
            [[nodes]]
            id = "!a"
            [[nodes.commands]]
            name = "x"
            "#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn duplicate_seed_names_rejected() {
        let mut c = Config::default();
        c.nodes.push(NodeSeed {
            id: "!a".into(),
            enabled: false,
            sensors: vec![SensorDefinition::numeric("x", "x").unwrap()],
            commands: vec![CommandDefinition::single_press("x", "go").unwrap()],
        });
        c.nodes.push(NodeSeed {
            id: "!a".into(),
            enabled: false,
            sensors: vec![],
            commands: vec![],
        });
        let err = format!("{:#}", c.validate().unwrap_err());
        assert!(err.contains("duplicate definition name 'x'"), "{err}");
        assert!(err.contains("duplicate id"), "{err}");
    }

    // -- environment ----------------------------------------------------------

    #[test]
    fn env_overrides_file_values() {
        let mut c = Config::default();
        c.apply_env(env(&[
            ("MQTT_HOST", "10.0.0.2"),
            ("MQTT_PORT", "8883"),
            ("DB_URL", "sqlite::memory:"),
            ("WEB_PORT", "8080"),
        ]))
        .unwrap();
        assert_eq!(c.mqtt.host, "10.0.0.2");
        assert_eq!(c.mqtt.port, 8883);
        assert_eq!(c.db_url, "sqlite::memory:");
        assert_eq!(c.web.port, 8080);
    }

    #[test]
    fn bad_env_port_is_an_error() {
        let mut c = Config::default();
        assert!(c.apply_env(env(&[("MQTT_PORT", "lots")])).is_err());
    }

    // -- save -----------------------------------------------------------------

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let path = std::env::temp_dir().join(format!("mesh-bridge-cfg-{}.toml", std::process::id()));
        let path = path.to_string_lossy().to_string();
        let mut c = Config::default();
        c.mqtt.host = "broker.lan".into();
        c.mqtt.username = Some("ha".into());
        c.nodes.push(NodeSeed {
            id: "!a".into(),
            enabled: true,
            sensors: vec![SensorDefinition::binary("leak", "leak", 5).unwrap()],
            commands: vec![],
        });
        c.save(&path).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(back, c);
    }
}
