//! Emulated device: the board side of the Breeze protocol
//!
//! Lifecycle: `Offline` → `Connecting` (go_online) → `Online` (handshake ok),
//! back to `Offline` on go_offline or when the bus drops. On every transition
//! to `Online` the device subscribes to its command filter, publishes a retained
//! discovery message and an initial status.
//!
//! Commands are the only way the actuator state changes; every change is echoed
//! on the state topic so the kernel registry catches up.

use crate::config::DeviceProfile;
use crate::identity::{NetworkIdentity, Telemetry};
use crate::signal::{self, SignalSnapshot};
use breeze_kernel::bus::{BusError, BusEvent, InboundMessage, MessageBus};
use breeze_kernel::models::{DeviceType, PowerState};
use breeze_kernel::payload::{decode_payload, expect_str};
use breeze_kernel::topic::{command_filter, device_topic, parse_topic, MessageKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Offline,
    Connecting,
    Online,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Retained announcement on `{ns}/devices/{id}/discovery`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub firmware: String,
    pub ip: String,
    pub mac: String,
    pub state: PowerState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_strength: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_heap: Option<u64>,
}

impl StatusMessage {
    /// Payload of the offline notice and of the MQTT last will
    pub fn offline() -> Self {
        Self { online: false, wifi_strength: None, uptime: None, free_heap: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMessage {
    pub state: PowerState,
    pub timestamp: DateTime<Utc>,
}

pub struct EmulatedDevice<B> {
    profile: DeviceProfile,
    namespace: String,
    bus: B,
    link: LinkState,
    /// L'opérateur veut ce device en ligne (reprise auto après coupure)
    desired_online: bool,
    power: PowerState,
    identity: Option<NetworkIdentity>,
    telemetry: Telemetry,
    booted: Instant,
    signal_dir: Option<PathBuf>,
}

impl<B: MessageBus> EmulatedDevice<B> {
    pub fn new(profile: DeviceProfile, namespace: &str, bus: B) -> Self {
        Self {
            power: profile.initial_state,
            telemetry: Telemetry::baseline(profile.device_type),
            profile,
            namespace: namespace.to_string(),
            bus,
            link: LinkState::Offline,
            desired_online: false,
            identity: None,
            booted: Instant::now(),
            signal_dir: None,
        }
    }

    pub fn with_signal_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.signal_dir = dir;
        self
    }

    pub fn id(&self) -> &str {
        &self.profile.id
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn power(&self) -> PowerState {
        self.power
    }

    pub fn identity(&self) -> Option<&NetworkIdentity> {
        self.identity.as_ref()
    }

    pub fn desired_online(&self) -> bool {
        self.desired_online
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    fn topic(&self, kind: MessageKind) -> String {
        device_topic(&self.namespace, &self.profile.id, &kind)
    }

    /// Offline → Connecting → Online ; un échec de handshake ramène à Offline
    pub async fn go_online(&mut self) -> Result<(), DeviceError> {
        if self.link == LinkState::Online {
            return Ok(());
        }
        self.desired_online = true;
        self.link = LinkState::Connecting;
        self.identity = Some(NetworkIdentity::generate(&mut rand::rng()));

        if let Err(e) = self.bus.connect().await {
            self.link = LinkState::Offline;
            warn!("[{}] connection failed: {}", self.profile.id, e);
            return Err(e.into());
        }
        self.announce().await
    }

    async fn announce(&mut self) -> Result<(), DeviceError> {
        let result = self.try_announce().await;
        match &result {
            Ok(()) => {
                self.link = LinkState::Online;
                info!("[{}] online as {} ({})", self.profile.id, self.ip(), self.mac());
                self.write_signal().await;
            }
            Err(e) => {
                self.link = LinkState::Offline;
                warn!("[{}] announce failed: {}", self.profile.id, e);
            }
        }
        result
    }

    async fn try_announce(&mut self) -> Result<(), DeviceError> {
        self.bus
            .subscribe(&command_filter(&self.namespace, &self.profile.id))
            .await?;
        self.publish_discovery().await?;
        self.publish_status().await
    }

    /// Online → Offline, volontaire : notice offline, désabonnement, déconnexion propre
    pub async fn go_offline(&mut self) -> Result<(), DeviceError> {
        self.desired_online = false;
        if self.link == LinkState::Offline {
            return Ok(());
        }

        if self.bus.is_connected() {
            let notice = serde_json::to_vec(&StatusMessage::offline())?;
            if let Err(e) = self.bus.publish(&self.topic(MessageKind::Status), notice, false).await {
                warn!("[{}] offline notice not sent: {}", self.profile.id, e);
            }
            if let Err(e) = self.bus.unsubscribe(&command_filter(&self.namespace, &self.profile.id)).await {
                debug!("[{}] unsubscribe failed: {}", self.profile.id, e);
            }
        }

        self.link = LinkState::Offline;
        self.remove_signal().await;
        self.bus.disconnect().await?;
        info!("[{}] offline", self.profile.id);
        Ok(())
    }

    pub async fn handle_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Connected => {
                if self.desired_online && self.link != LinkState::Online {
                    info!("[{}] link restored, announcing again", self.profile.id);
                    self.identity = Some(NetworkIdentity::generate(&mut rand::rng()));
                    self.link = LinkState::Connecting;
                    let _ = self.announce().await;
                }
            }
            BusEvent::Disconnected => {
                if self.link != LinkState::Offline {
                    warn!("[{}] link lost", self.profile.id);
                    self.link = LinkState::Offline;
                    self.remove_signal().await;
                }
            }
            BusEvent::Message(message) => self.handle_message(message).await,
        }
    }

    async fn handle_message(&mut self, message: InboundMessage) {
        let parsed = match parse_topic(&message.topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("[{}] ignoring {}: {}", self.profile.id, message.topic, e);
                return;
            }
        };
        if parsed.device_id != self.profile.id {
            return;
        }
        if let MessageKind::Command(name) = parsed.kind {
            if let Err(e) = self.handle_command(&name, &message.payload).await {
                warn!("[{}] command {} failed: {}", self.profile.id, name, e);
            }
        }
    }

    pub async fn handle_command(&mut self, name: &str, raw: &[u8]) -> Result<(), DeviceError> {
        let payload = decode_payload(raw);
        info!("[{}] command {} {:?}", self.profile.id, name, payload);

        match name {
            "set_state" => match expect_str(&payload, "state").as_deref().and_then(PowerState::parse) {
                Some(state) => self.apply_state(state).await,
                None => {
                    warn!("[{}] set_state without a valid state: {:?}", self.profile.id, payload);
                    Ok(())
                }
            },
            "toggle" => self.apply_state(self.power.toggled()).await,
            "ping" => self.publish_status().await,
            other => {
                warn!("[{}] unknown command '{}'", self.profile.id, other);
                Ok(())
            }
        }
    }

    async fn apply_state(&mut self, state: PowerState) -> Result<(), DeviceError> {
        self.power = state;
        info!("[{}] switched {}", self.profile.id, state);
        self.write_signal().await;
        self.publish_state().await
    }

    /// Rapport périodique : télémétrie bruitée puis status
    pub async fn status_tick(&mut self) -> Result<(), DeviceError> {
        if self.link != LinkState::Online {
            return Ok(());
        }
        self.telemetry.jitter(&mut rand::rng(), self.profile.device_type);
        self.publish_status().await
    }

    /// Bascule locale (mode auto) passant par le même chemin qu'une commande toggle
    pub async fn auto_toggle(&mut self) -> Result<(), DeviceError> {
        if self.link != LinkState::Online {
            return Ok(());
        }
        self.apply_state(self.power.toggled()).await
    }

    pub fn discovery_message(&self) -> DiscoveryMessage {
        DiscoveryMessage {
            id: self.profile.id.clone(),
            name: self.profile.display_name(),
            device_type: self.profile.device_type,
            firmware: self.profile.firmware.clone(),
            ip: self.ip(),
            mac: self.mac(),
            state: self.power,
        }
    }

    pub fn status_message(&self) -> StatusMessage {
        StatusMessage {
            online: true,
            wifi_strength: Some(self.telemetry.wifi_strength),
            uptime: Some(self.booted.elapsed().as_secs()),
            free_heap: Some(self.telemetry.free_heap),
        }
    }

    async fn publish_discovery(&self) -> Result<(), DeviceError> {
        let body = serde_json::to_vec(&self.discovery_message())?;
        self.bus.publish(&self.topic(MessageKind::Discovery), body, true).await?;
        Ok(())
    }

    async fn publish_status(&self) -> Result<(), DeviceError> {
        let body = serde_json::to_vec(&self.status_message())?;
        self.bus.publish(&self.topic(MessageKind::Status), body, false).await?;
        debug!("[{}] status sent", self.profile.id);
        Ok(())
    }

    async fn publish_state(&self) -> Result<(), DeviceError> {
        let message = StateMessage { state: self.power, timestamp: Utc::now() };
        let body = serde_json::to_vec(&message)?;
        self.bus.publish(&self.topic(MessageKind::State), body, false).await?;
        Ok(())
    }

    fn ip(&self) -> String {
        self.identity.as_ref().map(|i| i.ip.clone()).unwrap_or_default()
    }

    fn mac(&self) -> String {
        self.identity.as_ref().map(|i| i.mac.clone()).unwrap_or_default()
    }

    pub fn snapshot(&self) -> SignalSnapshot {
        SignalSnapshot {
            id: self.profile.id.clone(),
            name: self.profile.display_name(),
            state: self.power.to_string(),
            online: self.link == LinkState::Online,
            ip: self.ip(),
            mac: self.mac(),
            updated_at: Utc::now(),
        }
    }

    async fn write_signal(&self) {
        let Some(dir) = &self.signal_dir else { return };
        if self.link != LinkState::Online {
            return;
        }
        if let Err(e) = signal::write_signal(dir, &self.snapshot()).await {
            warn!("[{}] signal file not written: {}", self.profile.id, e);
        }
    }

    async fn remove_signal(&self) {
        let Some(dir) = &self.signal_dir else { return };
        if let Err(e) = signal::remove_signal(dir, &self.profile.id).await {
            warn!("[{}] signal file not removed: {}", self.profile.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use breeze_kernel::bus::{BusEvents, MemoryBroker, MemoryBus};
    use serde_json::json;

    const DISCOVERY: &str = "breeze/devices/esp32-001/discovery";
    const STATUS: &str = "breeze/devices/esp32-001/status";
    const STATE: &str = "breeze/devices/esp32-001/state";

    fn device(broker: &MemoryBroker) -> (EmulatedDevice<MemoryBus>, BusEvents) {
        let (bus, events) = broker.client("esp32-001");
        let profile = DeviceProfile::new("esp32-001", DeviceType::Esp32);
        (EmulatedDevice::new(profile, "breeze", bus), events)
    }

    #[tokio::test]
    async fn going_online_announces_in_order() {
        let broker = MemoryBroker::new();
        let (mut dev, _events) = device(&broker);
        dev.go_online().await.unwrap();

        assert_eq!(dev.link(), LinkState::Online);
        assert_eq!(broker.subscriptions("esp32-001"), vec!["breeze/devices/esp32-001/command/+".to_string()]);

        let topics: Vec<String> = broker.published().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec![DISCOVERY.to_string(), STATUS.to_string()]);

        let discovery = broker.published_on(DISCOVERY)[0].clone();
        assert!(discovery.retain);
        let body = discovery.json().unwrap();
        assert_eq!(body["type"], "ESP32");
        assert_eq!(body["state"], "off");
        assert!(body["mac"].as_str().unwrap().starts_with("24:0A:C4"));

        let status = broker.published_on(STATUS)[0].json().unwrap();
        assert_eq!(status["online"], true);
        assert!(status["free_heap"].is_u64());
    }

    #[tokio::test]
    async fn fresh_identity_on_each_connection() {
        let broker = MemoryBroker::new();
        let (mut dev, _events) = device(&broker);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            dev.go_online().await.unwrap();
            seen.insert(dev.identity().unwrap().mac.clone());
            dev.go_offline().await.unwrap();
        }
        assert!(seen.len() > 1);
    }

    #[tokio::test]
    async fn set_state_applies_and_echoes() {
        let broker = MemoryBroker::new();
        let (mut dev, _events) = device(&broker);
        dev.go_online().await.unwrap();
        broker.clear_log();

        dev.handle_command("set_state", br#"{"state":"on"}"#).await.unwrap();
        assert_eq!(dev.power(), PowerState::On);

        let echoed = broker.published_on(STATE);
        assert_eq!(echoed.len(), 1);
        assert_eq!(echoed[0].json().unwrap()["state"], "on");
    }

    #[tokio::test]
    async fn toggle_ping_and_unknown_commands() {
        let broker = MemoryBroker::new();
        let (mut dev, _events) = device(&broker);
        dev.go_online().await.unwrap();
        broker.clear_log();

        dev.handle_command("toggle", b"{}").await.unwrap();
        assert_eq!(dev.power(), PowerState::On);

        dev.handle_command("ping", b"").await.unwrap();
        assert_eq!(broker.published_on(STATUS).len(), 1);

        dev.handle_command("reboot", b"{}").await.unwrap();
        dev.handle_command("set_state", br#"{"state":"dim"}"#).await.unwrap();
        assert_eq!(dev.power(), PowerState::On);
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn commands_arrive_through_the_bus() {
        let broker = MemoryBroker::new();
        let (mut dev, mut events) = device(&broker);
        dev.go_online().await.unwrap();

        let (kernel, _kernel_events) = broker.client("kernel");
        kernel.connect().await.unwrap();
        kernel
            .publish("breeze/devices/esp32-001/command/set_state", br#"{"state":"on"}"#.to_vec(), false)
            .await
            .unwrap();
        kernel
            .publish("breeze/devices/other/command/set_state", br#"{"state":"on"}"#.to_vec(), false)
            .await
            .unwrap();

        while let Ok(event) = events.try_recv() {
            dev.handle_bus_event(event).await;
        }
        assert_eq!(dev.power(), PowerState::On);
        assert_eq!(broker.published_on(STATE).len(), 1);
    }

    #[tokio::test]
    async fn going_offline_notifies_and_cleans_up() {
        let broker = MemoryBroker::new();
        let signals = tempfile::tempdir().unwrap();
        let (bus, _events) = broker.client("esp32-001");
        let profile = DeviceProfile::new("esp32-001", DeviceType::Esp32);
        let mut dev = EmulatedDevice::new(profile, "breeze", bus).with_signal_dir(Some(signals.path().to_path_buf()));

        dev.go_online().await.unwrap();
        let signal_file = signals.path().join("esp32-001.json");
        assert!(signal_file.exists());

        broker.clear_log();
        dev.go_offline().await.unwrap();

        assert_eq!(dev.link(), LinkState::Offline);
        assert!(!dev.desired_online());
        assert!(!signal_file.exists());
        assert!(broker.subscriptions("esp32-001").is_empty());
        assert!(!dev.bus().is_connected());

        let notice = broker.published_on(STATUS);
        assert_eq!(notice.len(), 1);
        assert_eq!(notice[0].json(), Some(json!({"online": false})));
    }

    #[tokio::test]
    async fn dropped_link_resumes_on_reconnect() {
        let broker = MemoryBroker::new();
        let (mut dev, mut events) = device(&broker);
        dev.go_online().await.unwrap();
        while events.try_recv().is_ok() {}

        broker.drop_connection("esp32-001");
        let event = events.try_recv().unwrap();
        dev.handle_bus_event(event).await;
        assert_eq!(dev.link(), LinkState::Offline);
        assert!(dev.desired_online());

        broker.clear_log();
        dev.bus().connect().await.unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event, BusEvent::Connected);
        dev.handle_bus_event(event).await;

        assert_eq!(dev.link(), LinkState::Online);
        assert_eq!(broker.published_on(DISCOVERY).len(), 1);
    }

    #[tokio::test]
    async fn status_tick_only_when_online() {
        let broker = MemoryBroker::new();
        let (mut dev, _events) = device(&broker);
        dev.status_tick().await.unwrap();
        assert!(broker.published().is_empty());

        dev.go_online().await.unwrap();
        dev.status_tick().await.unwrap();
        assert_eq!(broker.published_on(STATUS).len(), 2);
    }
}
