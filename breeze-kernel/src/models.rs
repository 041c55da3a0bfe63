/**
 * MODÈLE DEVICE - Enregistrement d'un device ESP connu du kernel
 *
 * RÔLE : DeviceRecord = vue consolidée d'un device (identité + status + state + télémétrie).
 * DeviceUpdate = mise à jour partielle : seuls les champs présents écrasent l'existant.
 *
 * INVARIANTS :
 * - status ∈ {online, offline}, state ∈ {on, off} : rien d'autre n'est jamais stocké
 * - last_seen ne recule jamais (max entre l'ancien et le nouveau)
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use tracing::warn;

/// Famille matérielle annoncée par le device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum DeviceType {
    #[default]
    Esp32,
    Esp8266,
    Esp32S3,
    Esp32C3,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Esp32 => "ESP32",
            DeviceType::Esp8266 => "ESP8266",
            DeviceType::Esp32S3 => "ESP32-S3",
            DeviceType::Esp32C3 => "ESP32-C3",
            DeviceType::Unknown => "unknown",
        }
    }

    /// Reconnaît les libellés usuels (casse et tirets ignorés)
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized: String = label
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_ascii_uppercase();

        match normalized.as_str() {
            "ESP32" => Some(DeviceType::Esp32),
            "ESP8266" => Some(DeviceType::Esp8266),
            "ESP32S3" => Some(DeviceType::Esp32S3),
            "ESP32C3" => Some(DeviceType::Esp32C3),
            "UNKNOWN" => Some(DeviceType::Unknown),
            _ => None,
        }
    }

    /// Libellé inconnu → type par défaut (ESP32)
    pub fn coerce(label: &str) -> Self {
        Self::from_label(label).unwrap_or_else(|| {
            warn!("[models] unrecognized device type '{}', defaulting to {}", label, DeviceType::default());
            DeviceType::default()
        })
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for DeviceType {
    fn from(label: String) -> Self {
        DeviceType::coerce(&label)
    }
}

impl From<DeviceType> for &'static str {
    fn from(device_type: DeviceType) -> Self {
        device_type.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "online" => Some(DeviceStatus::Online),
            "offline" => Some(DeviceStatus::Offline),
            _ => None,
        }
    }
}

/// Position de l'actionneur binaire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    #[default]
    Off,
}

impl PowerState {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "on" => Some(PowerState::On),
            "off" => Some(PowerState::Off),
            _ => None,
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            PowerState::On => PowerState::Off,
            PowerState::Off => PowerState::On,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Off => "off",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub status: DeviceStatus,
    pub state: PowerState,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
    pub firmware_version: Option<String>,
    pub wifi_strength: Option<i64>,
    pub uptime: Option<u64>,
    pub free_heap: Option<u64>,
}

impl DeviceRecord {
    /// Enregistrement avec les valeurs par défaut de création
    pub fn new(id: &str, now: OffsetDateTime) -> Self {
        Self {
            id: id.to_string(),
            name: default_name(id),
            device_type: DeviceType::default(),
            status: DeviceStatus::Online,
            state: PowerState::Off,
            last_seen: now,
            ip_address: None,
            mac_address: None,
            firmware_version: None,
            wifi_strength: None,
            uptime: None,
            free_heap: None,
        }
    }

    /// Merge non destructif : seuls les champs `Some` sont appliqués
    pub fn apply(&mut self, update: &DeviceUpdate, now: OffsetDateTime) {
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(device_type) = update.device_type {
            self.device_type = device_type;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(state) = update.state {
            self.state = state;
        }
        if let Some(ip) = &update.ip_address {
            self.ip_address = Some(ip.clone());
        }
        if let Some(mac) = &update.mac_address {
            self.mac_address = Some(mac.clone());
        }
        if let Some(firmware) = &update.firmware_version {
            self.firmware_version = Some(firmware.clone());
        }
        if let Some(rssi) = update.wifi_strength {
            self.wifi_strength = Some(rssi);
        }
        if let Some(uptime) = update.uptime {
            self.uptime = Some(uptime);
        }
        if let Some(heap) = update.free_heap {
            self.free_heap = Some(heap);
        }
        if now > self.last_seen {
            self.last_seen = now;
        }
    }
}

pub fn default_name(id: &str) -> String {
    format!("Device {id}")
}

/// Mise à jour partielle extraite d'un message entrant
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    pub name: Option<String>,
    pub device_type: Option<DeviceType>,
    pub status: Option<DeviceStatus>,
    pub state: Option<PowerState>,
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
    pub firmware_version: Option<String>,
    pub wifi_strength: Option<i64>,
    pub uptime: Option<u64>,
    pub free_heap: Option<u64>,
}

impl DeviceUpdate {
    pub fn with_state(state: PowerState) -> Self {
        Self { state: Some(state), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn device_type_labels() {
        assert_eq!(DeviceType::from_label("esp32-s3"), Some(DeviceType::Esp32S3));
        assert_eq!(DeviceType::from_label("ESP32C3"), Some(DeviceType::Esp32C3));
        assert_eq!(DeviceType::from_label("esp8266"), Some(DeviceType::Esp8266));
        assert_eq!(DeviceType::from_label("unknown"), Some(DeviceType::Unknown));
        assert_eq!(DeviceType::from_label("RP2040"), None);
        assert_eq!(DeviceType::coerce("RP2040"), DeviceType::Esp32);
    }

    #[test]
    fn device_type_serializes_with_wire_labels() {
        let json = serde_json::to_string(&DeviceType::Esp32S3).unwrap();
        assert_eq!(json, "\"ESP32-S3\"");
        let parsed: DeviceType = serde_json::from_str("\"esp32-c3\"").unwrap();
        assert_eq!(parsed, DeviceType::Esp32C3);
    }

    #[test]
    fn power_state_parse_is_case_insensitive() {
        assert_eq!(PowerState::parse(" ON "), Some(PowerState::On));
        assert_eq!(PowerState::parse("off"), Some(PowerState::Off));
        assert_eq!(PowerState::parse("flicker"), None);
        assert_eq!(PowerState::On.toggled(), PowerState::Off);
    }

    #[test]
    fn apply_keeps_absent_fields() {
        let now = OffsetDateTime::now_utc();
        let mut record = DeviceRecord::new("esp32-001", now);
        record.name = "Lamp".into();
        record.wifi_strength = Some(-70);

        let update = DeviceUpdate { uptime: Some(120), ..DeviceUpdate::default() };
        record.apply(&update, now);

        assert_eq!(record.name, "Lamp");
        assert_eq!(record.wifi_strength, Some(-70));
        assert_eq!(record.uptime, Some(120));
    }

    #[test]
    fn last_seen_never_goes_backwards() {
        let now = OffsetDateTime::now_utc();
        let mut record = DeviceRecord::new("esp32-001", now);
        record.apply(&DeviceUpdate::default(), now - Duration::seconds(30));
        assert_eq!(record.last_seen, now);

        let later = now + Duration::seconds(5);
        record.apply(&DeviceUpdate::default(), later);
        assert_eq!(record.last_seen, later);
    }

    #[test]
    fn record_serializes_type_field() {
        let record = DeviceRecord::new("esp32-001", OffsetDateTime::UNIX_EPOCH);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "ESP32");
        assert_eq!(json["status"], "online");
        assert_eq!(json["state"], "off");
        assert_eq!(json["name"], "Device esp32-001");
        assert_eq!(json["last_seen"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn record_reads_back_from_dashboard_json() {
        let json = r#"{
            "id": "esp32-001", "name": "Lamp", "type": "ESP32-C3", "status": "offline", "state": "on",
            "last_seen": "2024-05-01T12:30:00Z", "ip_address": null, "mac_address": null,
            "firmware_version": "1.2.0", "wifi_strength": -61, "uptime": 90, "free_heap": null
        }"#;
        let record: DeviceRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.device_type, DeviceType::Esp32C3);
        assert_eq!(record.status, DeviceStatus::Offline);
        assert_eq!(record.last_seen.unix_timestamp(), 1_714_566_600);
        assert!(serde_json::from_str::<DeviceRecord>(&json.replace("2024-05-01T12:30:00Z", "yesterday")).is_err());
    }
}
