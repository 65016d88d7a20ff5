//! Inbound mesh traffic: classify each packet by payload kind and apply it
//! to the registry.

use tracing::{debug, warn};

use crate::bridge::Bridge;
use crate::decoder;
use crate::packet::{parse_line, MeshLine, MeshPacket, NodeUser, Payload};
use crate::state::now_unix;

impl Bridge {
    /// Handle one line from the mesh endpoint. Lines that do not parse are
    /// logged and skipped.
    pub async fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match parse_line(line) {
            Ok(MeshLine::Packet(packet)) => self.handle_packet(packet).await,
            Ok(MeshLine::NodeInfo(user)) => self.handle_node_info(user).await,
            Err(e) => {
                warn!(line, "unreadable mesh line: {e}");
                self.inner
                    .activity
                    .write()
                    .await
                    .record_error(format!("unreadable mesh line: {e}"));
            }
        }
    }

    pub async fn handle_packet(&self, packet: MeshPacket) {
        let id = packet.from;
        if id.trim().is_empty() {
            debug!("packet without sender");
            return;
        }
        let ts = packet.rx_time.filter(|t| *t > 0).unwrap_or_else(now_unix);
        let kind = packet.payload.as_ref().map_or("empty", Payload::kind);
        debug!(node = %id, kind, "packet");

        let mut reg = self.inner.registry.lock().await;
        reg.touch(&id, ts);
        let publishes = match packet.payload {
            None => Vec::new(),
            Some(Payload::NodeIdentity(user)) => {
                self.inner.mesh.remember(&id, &user);
                reg.set_identity(&id, &user, ts)
            }
            Some(Payload::Text(text)) => {
                let outcome = reg.apply_text(&id, &text, ts);
                for arm in outcome.arm {
                    self.arm_delay_off(&mut reg, &id, arm);
                }
                outcome.publishes
            }
            Some(Payload::Telemetry(raw)) => {
                let metrics = decoder::decode(&raw, &id);
                reg.apply_telemetry(&id, &metrics, ts)
            }
            Some(Payload::Position(pos)) => reg.apply_position(&id, &pos, ts),
        };
        self.commit(&reg, publishes);
        drop(reg);

        self.inner.activity.write().await.record_packet(&id, kind);
    }

    /// Node-database entry from the endpoint: cache it for lookups and name
    /// the node right away if it is still unnamed.
    async fn handle_node_info(&self, user: NodeUser) {
        if user.id.trim().is_empty() {
            return;
        }
        self.inner.mesh.remember(&user.id, &user);
        let mut reg = self.inner.registry.lock().await;
        let unnamed = reg.node(&user.id).is_some_and(|n| n.needs_name(&user.id));
        if unnamed {
            let out = reg.set_identity(&user.id, &user, now_unix());
            self.commit(&reg, out);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use crate::bridge::tests::{bridge, drain};
    use crate::model::SensorDefinition;
    use crate::mqtt::Publish;
    use std::time::Duration;

    const N: &str = "!a1b2c3";

    fn text_line(text: &str) -> String {
        serde_json::json!({"fromId": N, "rxTime": 1_700_000_000, "decoded": {"text": text}})
            .to_string()
    }

    // -- classification -------------------------------------------------------

    #[tokio::test]
    async fn first_packet_creates_node() {
        let (b, mut ch) = bridge();
        b.handle_line(&text_line("hello")).await;
        let view = b.node_view(N).await.unwrap();
        assert_eq!(view.node.info.last_heard, 1_700_000_000);
        assert_eq!(view.node.messages.len(), 1);
        assert_eq!(
            drain(&mut ch.outbox),
            vec![Publish::retained("Mesh/feeds/!a1b2c3/text", "hello")]
        );
    }

    #[tokio::test]
    async fn literal_telemetry_is_decoded() {
        let (b, mut ch) = bridge();
        let line = serde_json::json!({
            "fromId": N,
            "decoded": {"telemetry": "{'deviceMetrics': {'batteryLevel': 90, 'voltage': 4.05}}"}
        });
        b.handle_line(&line.to_string()).await;
        let out = drain(&mut ch.outbox);
        assert!(out.contains(&Publish::retained(
            "Mesh/feeds/!a1b2c3/telemetry/batterylevel",
            "90.0"
        )));
        assert!(out.contains(&Publish::retained("Mesh/feeds/!a1b2c3/telemetry/voltage", "4.05")));
    }

    #[tokio::test]
    async fn garbage_is_skipped() {
        let (b, mut ch) = bridge();
        b.handle_line("{not json").await;
        let line = serde_json::json!({"fromId": N, "decoded": {"telemetry": "%%%"}});
        b.handle_line(&line.to_string()).await;
        b.handle_line(&text_line("still alive")).await;

        let out = drain(&mut ch.outbox);
        assert_eq!(out.last().unwrap().payload, "still alive");
        assert_eq!(b.status().await.activity.packets, 2);
    }

    #[tokio::test]
    async fn packet_without_sender_is_skipped_quietly() {
        let (b, mut ch) = bridge();
        b.handle_line(r#"{"decoded":{"text":"local"}}"#).await;
        b.handle_line(r#"{"fromId":null,"decoded":{"text":"local"}}"#).await;
        b.handle_line(r#"{"fromId":" ","decoded":{"text":"local"}}"#).await;

        assert!(drain(&mut ch.outbox).is_empty());
        let status = b.status().await;
        assert!(status.nodes.is_empty());
        assert_eq!(status.activity.packets, 0);
        assert!(status.activity.events.is_empty());
    }

    #[tokio::test]
    async fn node_info_names_unnamed_nodes() {
        let (b, _ch) = bridge();
        b.handle_line(&text_line("hi")).await;
        b.handle_line(r#"{"nodeInfo":{"id":"!a1b2c3","shortName":"PMP","longName":"Pump house"}}"#)
            .await;
        let view = b.node_view(N).await.unwrap();
        assert_eq!(view.node.info.short_name, "PMP");
        assert_eq!(b.mesh().lookup(N).await.unwrap().long_name, "Pump house");
    }

    // -- delay-off ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn binary_sensor_turns_off_after_delay() {
        let (b, mut ch) = bridge();
        b.handle_line(&text_line("boot")).await;
        b.add_sensor(N, SensorDefinition::binary("leak", "leak", 5).unwrap())
            .await
            .unwrap();
        drain(&mut ch.outbox);

        b.handle_line(&text_line("leak detected")).await;
        assert!(drain(&mut ch.outbox)
            .contains(&Publish::retained("Mesh/feeds/!a1b2c3/custom/leak", "ON")));

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(drain(&mut ch.outbox).is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            drain(&mut ch.outbox),
            vec![Publish::retained("Mesh/feeds/!a1b2c3/custom/leak", "OFF")]
        );
        assert!(b.node_view(N).await.unwrap().pending_timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retrigger_restarts_the_delay() {
        let (b, mut ch) = bridge();
        b.handle_line(&text_line("boot")).await;
        b.add_sensor(N, SensorDefinition::binary("leak", "leak", 5).unwrap())
            .await
            .unwrap();

        b.handle_line(&text_line("leak")).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        b.handle_line(&text_line("leak again")).await;
        drain(&mut ch.outbox);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(drain(&mut ch.outbox).is_empty(), "first timer should be gone");

        tokio::time::sleep(Duration::from_secs(3)).await;
        let offs: Vec<Publish> = drain(&mut ch.outbox)
            .into_iter()
            .filter(|p| p.payload == "OFF")
            .collect();
        assert_eq!(offs.len(), 1);
    }
}
