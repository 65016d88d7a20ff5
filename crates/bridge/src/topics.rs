//! MQTT topic layout: state topics under the configurable prefix, discovery
//! topics under the discovery prefix, and parsing of inbound relay topics.

use crate::discovery::EntityKind;

pub const DEFAULT_PREFIX: &str = "Mesh/feeds";
pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";

/// Node id used on the text topic to address every node at once.
pub const BROADCAST: &str = "broadcast";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
    discovery_prefix: String,
}

/// An inbound message the bridge relays onto the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound<'a> {
    Text { node: &'a str },
    Command { node: &'a str, name: &'a str },
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX, DEFAULT_DISCOVERY_PREFIX)
    }
}

impl Topics {
    pub fn new(prefix: impl Into<String>, discovery_prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_matches('/').to_string(),
            discovery_prefix: discovery_prefix.into().trim_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    // -- state topics ---------------------------------------------------------

    pub fn text(&self, node: &str) -> String {
        format!("{}/{node}/text", self.prefix)
    }

    pub fn telemetry(&self, node: &str, key: &str) -> String {
        format!("{}/{node}/telemetry/{key}", self.prefix)
    }

    pub fn location(&self, node: &str) -> String {
        format!("{}/{node}/position/location", self.prefix)
    }

    pub fn position(&self, node: &str, key: &str) -> String {
        format!("{}/{node}/position/{key}", self.prefix)
    }

    pub fn sensor(&self, node: &str, sub_topic: &str, name: &str) -> String {
        format!("{}/{node}/{sub_topic}/{name}", self.prefix)
    }

    pub fn command(&self, node: &str, name: &str) -> String {
        format!("{}/{node}/command/{name}", self.prefix)
    }

    pub fn command_state(&self, node: &str, name: &str) -> String {
        format!("{}/{node}/command/{name}/state", self.prefix)
    }

    // -- discovery topics -----------------------------------------------------

    pub fn discovery(&self, kind: EntityKind, object_id: &str) -> String {
        format!("{}/{}/{object_id}/config", self.discovery_prefix, kind.as_str())
    }

    pub fn refresh_button(&self, node_safe: &str) -> String {
        format!("{}/button/{node_safe}_refresh_data/config", self.discovery_prefix)
    }

    // -- inbound --------------------------------------------------------------

    /// Filters the bridge subscribes to for the MQTT -> mesh relay.
    pub fn subscriptions(&self) -> [String; 2] {
        [
            format!("{}/+/text", self.prefix),
            format!("{}/+/command/+", self.prefix),
        ]
    }

    /// Match "<prefix>/<node>/text" or "<prefix>/<node>/command/<name>".
    pub fn parse_inbound<'a>(&self, topic: &'a str) -> Option<Inbound<'a>> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [node, "text"] if !node.is_empty() => Some(Inbound::Text { node: *node }),
            [node, "command", name] if !node.is_empty() && !name.is_empty() => {
                Some(Inbound::Command { node: *node, name: *name })
            }
            _ => None,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> Topics {
        Topics::default()
    }

    // -- state topics ---------------------------------------------------------

    #[test]
    fn state_topics_follow_layout() {
        let t = topics();
        assert_eq!(t.text("!a1b2"), "Mesh/feeds/!a1b2/text");
        assert_eq!(t.telemetry("!a1b2", "voltage"), "Mesh/feeds/!a1b2/telemetry/voltage");
        assert_eq!(t.location("!a1b2"), "Mesh/feeds/!a1b2/position/location");
        assert_eq!(t.position("!a1b2", "altitude"), "Mesh/feeds/!a1b2/position/altitude");
        assert_eq!(t.sensor("!a1b2", "custom", "leak"), "Mesh/feeds/!a1b2/custom/leak");
        assert_eq!(t.command_state("!a1b2", "pump"), "Mesh/feeds/!a1b2/command/pump/state");
    }

    #[test]
    fn prefix_slashes_are_trimmed() {
        let t = Topics::new("/home/mesh/", "homeassistant/");
        assert_eq!(t.text("n"), "home/mesh/n/text");
        assert_eq!(
            t.discovery(EntityKind::Switch, "n_pump"),
            "homeassistant/switch/n_pump/config"
        );
    }

    #[test]
    fn subscriptions_cover_text_and_commands() {
        let [text, cmd] = topics().subscriptions();
        assert_eq!(text, "Mesh/feeds/+/text");
        assert_eq!(cmd, "Mesh/feeds/+/command/+");
    }

    // -- parse_inbound --------------------------------------------------------

    #[test]
    fn parse_text_topic() {
        assert_eq!(
            topics().parse_inbound("Mesh/feeds/!a1b2/text"),
            Some(Inbound::Text { node: "!a1b2" })
        );
    }

    #[test]
    fn parse_command_topic() {
        assert_eq!(
            topics().parse_inbound("Mesh/feeds/!a1b2/command/pump"),
            Some(Inbound::Command { node: "!a1b2", name: "pump" })
        );
    }

    #[test]
    fn parse_rejects_command_state_topic() {
        assert_eq!(topics().parse_inbound("Mesh/feeds/!a1b2/command/pump/state"), None);
    }

    #[test]
    fn parse_rejects_wrong_prefix() {
        assert_eq!(topics().parse_inbound("Other/feeds/!a1b2/text"), None);
        assert_eq!(topics().parse_inbound("Mesh/feedsx/!a1b2/text"), None);
    }

    #[test]
    fn parse_rejects_other_shapes() {
        let t = topics();
        assert_eq!(t.parse_inbound("Mesh/feeds/!a1b2/telemetry/voltage"), None);
        assert_eq!(t.parse_inbound("Mesh/feeds//text"), None);
        assert_eq!(t.parse_inbound("Mesh/feeds/!a1b2/command/"), None);
        assert_eq!(t.parse_inbound(""), None);
    }
}
