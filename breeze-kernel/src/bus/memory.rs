/*!
Broker MQTT en mémoire

Remplace mosquitto pour les tests et la démo : messages retenus, wildcards `+`/`#`,
connexion/déconnexion par client, last will, et journal de tous les messages publiés
pour les assertions.
*/

use super::{BusError, BusEvent, BusEvents, InboundMessage, MessageBus};
use crate::health::{BusHealth, HealthTracker};
use crate::topic::topic_matches;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub client_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

struct ClientSlot {
    connected: bool,
    subscriptions: BTreeSet<String>,
    events: mpsc::UnboundedSender<BusEvent>,
    last_will: Option<(String, Vec<u8>)>,
    health: HealthTracker,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<String, ClientSlot>,
    retained: BTreeMap<String, Vec<u8>>,
    log: Vec<PublishedMessage>,
}

impl BrokerState {
    fn route(&mut self, from: &str, topic: &str, payload: Vec<u8>, retain: bool) {
        self.log.push(PublishedMessage {
            client_id: from.to_string(),
            topic: topic.to_string(),
            payload: payload.clone(),
            retain,
        });

        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_string(), payload.clone());
            }
        }

        for slot in self.clients.values() {
            if !slot.connected || !slot.subscriptions.iter().any(|f| topic_matches(f, topic)) {
                continue;
            }
            slot.health.record_received();
            let _ = slot.events.send(BusEvent::Message(InboundMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
                retained: false,
            }));
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self, client_id: &str) -> (MemoryBus, BusEvents) {
        self.register(client_id, None)
    }

    /// Client avec last will, publié si la connexion est perdue sans disconnect propre
    pub fn client_with_last_will(&self, client_id: &str, topic: &str, payload: Vec<u8>) -> (MemoryBus, BusEvents) {
        self.register(client_id, Some((topic.to_string(), payload)))
    }

    fn register(&self, client_id: &str, last_will: Option<(String, Vec<u8>)>) -> (MemoryBus, BusEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let health = HealthTracker::new();
        self.state.lock().clients.insert(
            client_id.to_string(),
            ClientSlot {
                connected: false,
                subscriptions: BTreeSet::new(),
                events: tx,
                last_will,
                health: health.clone(),
            },
        );

        let bus = MemoryBus {
            broker: self.clone(),
            client_id: client_id.to_string(),
            health,
        };
        (bus, rx)
    }

    /// Simule une coupure réseau : last will publié, client déconnecté
    pub fn drop_connection(&self, client_id: &str) {
        let mut state = self.state.lock();
        let will = match state.clients.get_mut(client_id) {
            Some(slot) if slot.connected => {
                slot.connected = false;
                slot.subscriptions.clear();
                slot.health.mark_disconnected();
                let _ = slot.events.send(BusEvent::Disconnected);
                slot.last_will.clone()
            }
            _ => return,
        };

        if let Some((topic, payload)) = will {
            debug!("[memory-bus] delivering last will of {} on {}", client_id, topic);
            state.route(client_id, &topic, payload, false);
        }
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().log.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state.lock().retained.get(topic).cloned()
    }

    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        self.state
            .lock()
            .clients
            .get(client_id)
            .map(|slot| slot.subscriptions.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }
}

/// Handle client sur le broker mémoire
#[derive(Clone)]
pub struct MemoryBus {
    broker: MemoryBroker,
    client_id: String,
    health: HealthTracker,
}

impl MemoryBus {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn with_connected_slot<T>(&self, f: impl FnOnce(&mut BrokerState) -> T) -> Result<T, BusError> {
        let mut state = self.broker.state.lock();
        match state.clients.get(&self.client_id) {
            Some(slot) if slot.connected => Ok(f(&mut state)),
            _ => Err(BusError::NotConnected),
        }
    }
}

impl MessageBus for MemoryBus {
    async fn connect(&self) -> Result<(), BusError> {
        let mut state = self.broker.state.lock();
        let slot = state
            .clients
            .get_mut(&self.client_id)
            .ok_or_else(|| BusError::Transport(format!("unknown client {}", self.client_id)))?;
        if !slot.connected {
            slot.connected = true;
            slot.health.mark_connected();
            let _ = slot.events.send(BusEvent::Connected);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        let mut state = self.broker.state.lock();
        if let Some(slot) = state.clients.get_mut(&self.client_id) {
            if slot.connected {
                slot.connected = false;
                slot.subscriptions.clear();
                slot.health.mark_disconnected();
                let _ = slot.events.send(BusEvent::Disconnected);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        let client_id = self.client_id.clone();
        self.with_connected_slot(|state| {
            let retained: Vec<(String, Vec<u8>)> = state
                .retained
                .iter()
                .filter(|(topic, _)| topic_matches(filter, topic))
                .map(|(topic, payload)| (topic.clone(), payload.clone()))
                .collect();

            if let Some(slot) = state.clients.get_mut(&client_id) {
                slot.subscriptions.insert(filter.to_string());
                for (topic, payload) in retained {
                    slot.health.record_received();
                    let _ = slot.events.send(BusEvent::Message(InboundMessage { topic, payload, retained: true }));
                }
            }
        })
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BusError> {
        let client_id = self.client_id.clone();
        self.with_connected_slot(|state| {
            if let Some(slot) = state.clients.get_mut(&client_id) {
                slot.subscriptions.remove(filter);
            }
        })
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        let client_id = self.client_id.clone();
        self.with_connected_slot(|state| state.route(&client_id, topic, payload, retain))?;
        self.health.record_sent();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.health.is_connected()
    }

    fn health(&self) -> BusHealth {
        self.health.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(events: &mut BusEvents) -> Vec<BusEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn messages(events: &mut BusEvents) -> Vec<InboundMessage> {
        drain(events)
            .into_iter()
            .filter_map(|event| match event {
                BusEvent::Message(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let broker = MemoryBroker::new();
        let (bus, _events) = broker.client("kernel");
        assert_eq!(bus.publish("a/b/c", b"x".to_vec(), false).await, Err(BusError::NotConnected));
        assert_eq!(bus.subscribe("a/#").await, Err(BusError::NotConnected));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn routes_by_filter() {
        let broker = MemoryBroker::new();
        let (kernel, mut kernel_events) = broker.client("kernel");
        let (device, mut device_events) = broker.client("device");
        kernel.connect().await.unwrap();
        device.connect().await.unwrap();
        assert_eq!(drain(&mut kernel_events), vec![BusEvent::Connected]);

        kernel.subscribe("breeze/#").await.unwrap();
        device.subscribe("breeze/devices/d1/command/+").await.unwrap();

        device.publish("breeze/devices/d1/status", b"{}".to_vec(), false).await.unwrap();
        kernel.publish("breeze/devices/d1/command/toggle", b"{}".to_vec(), false).await.unwrap();
        kernel.publish("breeze/devices/d2/command/toggle", b"{}".to_vec(), false).await.unwrap();

        let kernel_topics: Vec<String> = messages(&mut kernel_events).into_iter().map(|m| m.topic).collect();
        assert_eq!(kernel_topics.len(), 3);

        let device_msgs = messages(&mut device_events);
        assert_eq!(device_msgs.len(), 1);
        assert_eq!(device_msgs[0].topic, "breeze/devices/d1/command/toggle");

        assert_eq!(broker.published().len(), 3);
        assert_eq!(kernel.health().messages_sent, 2);
    }

    #[tokio::test]
    async fn retained_messages_reach_late_subscribers() {
        let broker = MemoryBroker::new();
        let (device, _device_events) = broker.client("device");
        device.connect().await.unwrap();
        device.publish("breeze/devices/d1/discovery", b"{\"id\":\"d1\"}".to_vec(), true).await.unwrap();

        let (kernel, mut kernel_events) = broker.client("kernel");
        kernel.connect().await.unwrap();
        kernel.subscribe("breeze/devices/+/discovery").await.unwrap();

        let msgs = messages(&mut kernel_events);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].retained);
        assert!(broker.retained("breeze/devices/d1/discovery").is_some());

        device.publish("breeze/devices/d1/discovery", Vec::new(), true).await.unwrap();
        assert!(broker.retained("breeze/devices/d1/discovery").is_none());
    }

    #[tokio::test]
    async fn dropped_connection_delivers_last_will() {
        let broker = MemoryBroker::new();
        let (kernel, mut kernel_events) = broker.client("kernel");
        kernel.connect().await.unwrap();
        kernel.subscribe("breeze/#").await.unwrap();

        let (device, mut device_events) =
            broker.client_with_last_will("device", "breeze/devices/d1/status", b"{\"online\":false}".to_vec());
        device.connect().await.unwrap();
        broker.drop_connection("device");

        assert!(!device.is_connected());
        assert!(drain(&mut device_events).contains(&BusEvent::Disconnected));
        let msgs = messages(&mut kernel_events);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload, b"{\"online\":false}".to_vec());
    }

    #[tokio::test]
    async fn clean_disconnect_skips_last_will() {
        let broker = MemoryBroker::new();
        let (device, _events) = broker.client_with_last_will("device", "breeze/devices/d1/status", b"x".to_vec());
        device.connect().await.unwrap();
        device.subscribe("breeze/devices/d1/command/+").await.unwrap();
        device.disconnect().await.unwrap();

        broker.drop_connection("device");
        assert!(broker.published().is_empty());
        assert!(broker.subscriptions("device").is_empty());
    }
}
