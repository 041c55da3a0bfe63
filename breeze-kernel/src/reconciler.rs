/**
 * RÉCONCILIATEUR - Applique le trafic MQTT entrant au registre des devices
 *
 * RÔLE : topic → (device_id, kind), payload → map non typée → DeviceUpdate typé → merge.
 *
 * FONCTIONNEMENT :
 * - discovery : création avec défauts ou merge (status forcé à online)
 * - status    : online / wifi_strength / uptime / free_heap
 * - state     : on|off ; toute autre valeur retombe sur off (fail-safe actionneur)
 * - suffixe inconnu : champs d'identité → discovery, sinon status
 * - command   : écho de nos propres publications, ignoré
 *
 * Toujours total : une erreur est loggée et le message abandonné, jamais propagée
 * au callback du bus. Pas de numéro de séquence : last-write-wins à l'arrivée.
 */

use crate::bus::{BusEvent, BusEvents};
use crate::models::{DeviceStatus, DeviceType, DeviceUpdate, PowerState};
use crate::payload::{
    decode_payload, expect_bool, expect_i64, expect_str, expect_str_any, expect_u64, has_identity_fields, Payload,
};
use crate::registry::DeviceRegistry;
use crate::topic::{parse_topic, MessageKind};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Reconciler {
    registry: DeviceRegistry,
}

impl Reconciler {
    pub fn new(registry: DeviceRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Consomme les événements du bus jusqu'à fermeture du channel
    pub async fn run(&self, mut events: BusEvents) {
        while let Some(event) = events.recv().await {
            match event {
                BusEvent::Message(msg) => self.handle_publish(&msg.topic, &msg.payload),
                BusEvent::Connected => info!("[reconciler] bus connected"),
                BusEvent::Disconnected => warn!("[reconciler] bus disconnected"),
            }
        }
        debug!("[reconciler] event channel closed");
    }

    pub fn handle_publish(&self, topic: &str, payload: &[u8]) {
        match parse_topic(topic) {
            Ok(parsed) => self.reconcile(&parsed.device_id, &parsed.kind, payload),
            Err(e) => warn!("[reconciler] dropping message: {}", e),
        }
    }

    pub fn reconcile(&self, device_id: &str, kind: &MessageKind, raw: &[u8]) {
        let payload = decode_payload(raw);

        match kind {
            MessageKind::Discovery => self.apply_discovery(device_id, &payload),
            MessageKind::Status => self.apply_status(device_id, &payload),
            MessageKind::State => self.apply_state(device_id, &payload),
            MessageKind::Command(name) => {
                debug!("[reconciler] ignoring command echo {} for {}", name, device_id);
            }
            MessageKind::Other(suffix) => {
                if has_identity_fields(&payload) {
                    debug!("[reconciler] '{}' from {} treated as discovery", suffix, device_id);
                    self.apply_discovery(device_id, &payload);
                } else {
                    debug!("[reconciler] '{}' from {} treated as status", suffix, device_id);
                    self.apply_status(device_id, &payload);
                }
            }
        }
    }

    fn apply_discovery(&self, topic_id: &str, payload: &Payload) {
        let id = match expect_str(payload, "id") {
            Some(id) if !id.trim().is_empty() => id,
            _ => topic_id.to_string(),
        };
        if id != topic_id {
            debug!("[reconciler] discovery on topic of {} announces id {}", topic_id, id);
        }

        let update = discovery_update(payload);
        let record = self.registry.upsert_from_discovery(&id, &update);
        debug!("[reconciler] discovery applied to {} (state {})", record.id, record.state);
    }

    fn apply_status(&self, device_id: &str, payload: &Payload) {
        let update = status_update(payload);
        self.registry.merge_or_create(device_id, &update);
    }

    fn apply_state(&self, device_id: &str, payload: &Payload) {
        let update = state_update(payload);
        let (record, _) = self.registry.merge_or_create(device_id, &update);
        if update.state.is_some() {
            info!("[reconciler] {} is now {}", device_id, record.state);
        }
    }
}

pub fn discovery_update(payload: &Payload) -> DeviceUpdate {
    let state = expect_str(payload, "state").and_then(|raw| {
        let parsed = PowerState::parse(&raw);
        if parsed.is_none() {
            warn!("[reconciler] ignoring invalid discovery state '{}'", raw);
        }
        parsed
    });

    DeviceUpdate {
        name: expect_str(payload, "name").filter(|name| !name.trim().is_empty()),
        device_type: expect_str(payload, "type").map(|label| DeviceType::coerce(&label)),
        state,
        ip_address: expect_str_any(payload, &["ip", "ip_address"]),
        mac_address: expect_str_any(payload, &["mac", "mac_address"]),
        firmware_version: expect_str_any(payload, &["firmware", "firmware_version"]),
        ..DeviceUpdate::default()
    }
}

pub fn status_update(payload: &Payload) -> DeviceUpdate {
    let status = match expect_bool(payload, "online") {
        Some(true) => Some(DeviceStatus::Online),
        Some(false) => Some(DeviceStatus::Offline),
        None => expect_str(payload, "status").and_then(|raw| {
            let parsed = DeviceStatus::parse(&raw);
            if parsed.is_none() {
                warn!("[reconciler] ignoring invalid status '{}'", raw);
            }
            parsed
        }),
    };

    DeviceUpdate {
        status,
        wifi_strength: expect_i64(payload, "wifi_strength"),
        uptime: expect_u64(payload, "uptime"),
        free_heap: expect_u64(payload, "free_heap"),
        ..DeviceUpdate::default()
    }
}

/// Valeur invalide → off : l'actionneur finit toujours dans un état connu
pub fn state_update(payload: &Payload) -> DeviceUpdate {
    let Some(raw) = payload.get("state") else {
        return DeviceUpdate::default();
    };

    let state = raw.as_str().and_then(PowerState::parse).unwrap_or_else(|| {
        warn!("[reconciler] invalid state value {}, falling back to off", raw);
        PowerState::Off
    });
    DeviceUpdate::with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reconciler() -> Reconciler {
        Reconciler::new(DeviceRegistry::new())
    }

    fn publish(r: &Reconciler, topic: &str, payload: serde_json::Value) {
        r.handle_publish(topic, payload.to_string().as_bytes());
    }

    #[test]
    fn discovery_of_fresh_id_sets_all_fields() {
        let r = reconciler();
        publish(
            &r,
            "breeze/devices/esp32-001/discovery",
            json!({"id": "esp32-001", "name": "Lamp", "type": "ESP32-S3", "firmware": "1.4.2",
                   "ip": "192.168.1.40", "mac": "24:6F:28:AA:BB:CC", "state": "on"}),
        );

        let record = r.registry().get("esp32-001").unwrap();
        assert_eq!(record.status, DeviceStatus::Online);
        assert_eq!(record.name, "Lamp");
        assert_eq!(record.device_type, DeviceType::Esp32S3);
        assert_eq!(record.firmware_version.as_deref(), Some("1.4.2"));
        assert_eq!(record.ip_address.as_deref(), Some("192.168.1.40"));
        assert_eq!(record.mac_address.as_deref(), Some("24:6F:28:AA:BB:CC"));
        assert_eq!(record.state, PowerState::On);
    }

    #[test]
    fn discovery_defaults_id_from_topic() {
        let r = reconciler();
        publish(&r, "breeze/esp8266-3/discovery", json!({"type": "ESP8266"}));

        let record = r.registry().get("esp8266-3").unwrap();
        assert_eq!(record.name, "Device esp8266-3");
        assert_eq!(record.device_type, DeviceType::Esp8266);
        assert_eq!(record.state, PowerState::Off);
    }

    #[test]
    fn discovery_with_bogus_type_and_state_uses_defaults() {
        let r = reconciler();
        publish(&r, "breeze/devices/x/discovery", json!({"type": "Arduino", "state": "dim"}));
        let record = r.registry().get("x").unwrap();
        assert_eq!(record.device_type, DeviceType::Esp32);
        assert_eq!(record.state, PowerState::Off);
    }

    #[test]
    fn rediscovery_forces_online_and_keeps_other_fields() {
        let r = reconciler();
        publish(&r, "breeze/devices/d1/discovery", json!({"name": "Fan", "ip": "10.0.0.2"}));
        publish(&r, "breeze/devices/d1/status", json!({"online": false}));
        assert_eq!(r.registry().get("d1").unwrap().status, DeviceStatus::Offline);

        publish(&r, "breeze/devices/d1/discovery", json!({"ip": "10.0.0.9"}));
        let record = r.registry().get("d1").unwrap();
        assert_eq!(record.status, DeviceStatus::Online);
        assert_eq!(record.name, "Fan");
        assert_eq!(record.ip_address.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn status_merges_and_ignores_mistyped_fields() {
        let r = reconciler();
        publish(&r, "breeze/devices/d1/discovery", json!({"name": "Lamp"}));
        publish(&r, "breeze/devices/d1/status", json!({"online": true, "wifi_strength": -60, "uptime": 120}));
        publish(&r, "breeze/devices/d1/status", json!({"wifi_strength": "strong", "uptime": -1, "free_heap": 51200}));

        let record = r.registry().get("d1").unwrap();
        assert_eq!(record.name, "Lamp");
        assert_eq!(record.wifi_strength, Some(-60));
        assert_eq!(record.uptime, Some(120));
        assert_eq!(record.free_heap, Some(51200));
        assert_eq!(record.status, DeviceStatus::Online);
    }

    #[test]
    fn status_without_online_field_leaves_status() {
        let r = reconciler();
        publish(&r, "breeze/devices/d1/status", json!({"online": false}));
        publish(&r, "breeze/devices/d1/status", json!({"uptime": 5}));
        assert_eq!(r.registry().get("d1").unwrap().status, DeviceStatus::Offline);
    }

    #[test]
    fn duplicate_status_is_idempotent() {
        let r = reconciler();
        let status = json!({"online": true, "wifi_strength": -71, "uptime": 30, "free_heap": 4000});
        publish(&r, "breeze/devices/d1/status", status.clone());
        let first = r.registry().get("d1").unwrap();
        publish(&r, "breeze/devices/d1/status", status);
        let second = r.registry().get("d1").unwrap();

        assert_eq!(crate::models::DeviceRecord { last_seen: first.last_seen, ..second }, first);
    }

    #[test]
    fn invalid_state_is_coerced_to_off() {
        let r = reconciler();
        publish(&r, "breeze/devices/d1/state", json!({"state": "on"}));
        assert_eq!(r.registry().get("d1").unwrap().state, PowerState::On);

        publish(&r, "breeze/devices/d1/state", json!({"state": "flicker"}));
        assert_eq!(r.registry().get("d1").unwrap().state, PowerState::Off);

        publish(&r, "breeze/devices/d1/state", json!({"state": 1}));
        assert_eq!(r.registry().get("d1").unwrap().state, PowerState::Off);
    }

    #[test]
    fn plain_text_state_is_lowercased() {
        let r = reconciler();
        r.handle_publish("breeze/devices/d1/state", b"ON");
        assert_eq!(r.registry().get("d1").unwrap().state, PowerState::On);
    }

    #[test]
    fn unknown_ids_get_stub_records() {
        let r = reconciler();
        publish(&r, "breeze/devices/late/state", json!({"state": "on", "timestamp": 1700000000}));
        publish(&r, "breeze/other/status", json!({"online": true, "uptime": 9}));

        let late = r.registry().get("late").unwrap();
        assert_eq!(late.name, "Device late");
        assert_eq!(late.state, PowerState::On);
        assert_eq!(r.registry().get("other").unwrap().uptime, Some(9));
    }

    #[test]
    fn ad_hoc_suffix_dispatch() {
        let r = reconciler();
        publish(&r, "breeze/devices/d1/hello", json!({"name": "Porch", "type": "ESP32-C3"}));
        publish(&r, "breeze/devices/d2/telemetry", json!({"wifi_strength": -48}));

        let d1 = r.registry().get("d1").unwrap();
        assert_eq!(d1.name, "Porch");
        assert_eq!(d1.device_type, DeviceType::Esp32C3);
        assert_eq!(r.registry().get("d2").unwrap().wifi_strength, Some(-48));
    }

    #[test]
    fn malformed_topics_and_commands_leave_registry_untouched() {
        let r = reconciler();
        publish(&r, "breeze/status", json!({"online": true}));
        publish(&r, "breeze/devices/d1/command/set_state", json!({"state": "on"}));
        r.handle_publish("breeze/devices/d1", b"{}");
        assert!(r.registry().is_empty());
    }

    #[test]
    fn malformed_command_topics_cannot_rewrite_a_device() {
        let r = reconciler();
        publish(&r, "breeze/devices/d2/discovery", json!({"name": "Lamp"}));
        publish(&r, "breeze/devices/d2/status", json!({"online": false}));

        publish(&r, "breeze/devices/d2/command", json!({"name": "Hijacked", "online": true}));
        publish(&r, "breeze/devices/d2/command/", json!({"name": "Hijacked"}));
        publish(&r, "breeze/d2/command", json!({"type": "ESP8266"}));

        let d2 = r.registry().get("d2").unwrap();
        assert_eq!(d2.name, "Lamp");
        assert_eq!(d2.status, DeviceStatus::Offline);
        assert_eq!(d2.device_type, DeviceType::Esp32);

        publish(&r, "breeze/devices/d1/", json!({"online": true}));
        assert!(r.registry().get("d1").is_none());
        assert_eq!(r.registry().len(), 1);
    }

    #[test]
    fn two_segment_legacy_topic_names_a_device() {
        // {ns}/{id}/{kind} : "unknownroom" est lu comme un id de device
        let r = reconciler();
        publish(&r, "breeze/unknownroom/status", json!({"online": true}));

        assert_eq!(r.registry().len(), 1);
        let stub = r.registry().get("unknownroom").unwrap();
        assert_eq!(stub.name, "Device unknownroom");
        assert_eq!(stub.status, DeviceStatus::Online);
    }

    #[test]
    fn garbage_payload_does_not_panic() {
        let r = reconciler();
        r.handle_publish("breeze/devices/d1/discovery", &[0xff, 0xfe, 0x00]);
        r.handle_publish("breeze/devices/d1/status", b"{not json");
        assert_eq!(r.registry().len(), 1);
    }

    #[tokio::test]
    async fn run_drains_bus_events() {
        use crate::bus::{InboundMessage, BusEvent};

        let r = reconciler();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tx.send(BusEvent::Connected).unwrap();
        tx.send(BusEvent::Message(InboundMessage {
            topic: "breeze/devices/d9/discovery".into(),
            payload: br#"{"name":"Heater"}"#.to_vec(),
            retained: true,
        }))
        .unwrap();
        drop(tx);

        r.run(rx).await;
        assert_eq!(r.registry().get("d9").unwrap().name, "Heater");
    }
}
