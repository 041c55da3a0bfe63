/*!
Builders pour les topics et payloads du protocole Breeze

Formats courant (`{ns}/devices/{id}/{kind}`) et historique (`{ns}/{id}/{kind}`).
*/

use breeze_kernel::topic::{command_topic, device_topic, MessageKind};
use serde_json::Value;

pub struct BreezeMessageBuilder {
    namespace: String,
}

impl BreezeMessageBuilder {
    pub fn new<S: Into<String>>(namespace: S) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn discovery_topic(&self, device_id: &str) -> String {
        device_topic(&self.namespace, device_id, &MessageKind::Discovery)
    }

    pub fn status_topic(&self, device_id: &str) -> String {
        device_topic(&self.namespace, device_id, &MessageKind::Status)
    }

    pub fn state_topic(&self, device_id: &str) -> String {
        device_topic(&self.namespace, device_id, &MessageKind::State)
    }

    pub fn command_topic(&self, device_id: &str, command: &str) -> String {
        command_topic(&self.namespace, device_id, command)
    }

    /// Ancien format sans le segment `devices`
    pub fn legacy_topic(&self, device_id: &str, kind: &str) -> String {
        format!("{}/{}/{}", self.namespace, device_id, kind)
    }

    /// Crée un message discovery
    pub fn discovery<S: Into<String>>(id: S, name: S, device_type: S) -> Value {
        serde_json::json!({
            "id": id.into(),
            "name": name.into(),
            "type": device_type.into(),
            "firmware": "1.0.0",
            "ip": "192.168.1.150",
            "mac": "24:0A:C4:12:34:56"
        })
    }

    /// Crée un message status
    pub fn status(online: bool, wifi_strength: i64, uptime: u64, free_heap: u64) -> Value {
        serde_json::json!({
            "online": online,
            "wifi_strength": wifi_strength,
            "uptime": uptime,
            "free_heap": free_heap
        })
    }

    /// Crée un message state
    pub fn state<S: Into<String>>(state: S) -> Value {
        serde_json::json!({
            "state": state.into(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Crée une commande set_state
    pub fn set_state_command<S: Into<String>>(state: S) -> Value {
        serde_json::json!({ "state": state.into() })
    }
}
