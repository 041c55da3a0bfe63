/**
 * BUS DE MESSAGES - Abstraction publish/subscribe au-dessus du transport
 *
 * RÔLE : connect / subscribe / unsubscribe / publish / disconnect avec reconnexion.
 *
 * ARCHITECTURE : une task de fond pilote le transport et pousse des BusEvent
 * sur un channel ; publish ne fait qu'enfiler la requête côté transport.
 * - mqtt : broker réel via rumqttc
 * - memory : broker en mémoire (tests, démo sans mosquitto)
 */

pub mod memory;
pub mod mqtt;

use crate::health::BusHealth;
use std::future::Future;
use tokio::sync::mpsc;

pub use memory::{MemoryBroker, MemoryBus, PublishedMessage};
pub use mqtt::{MqttBus, MqttSettings};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Connected,
    Disconnected,
    Message(InboundMessage),
}

pub type BusEvents = mpsc::UnboundedReceiver<BusEvent>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("bus is not connected")]
    NotConnected,
    #[error("handshake with broker timed out after {0}s")]
    HandshakeTimeout(u64),
    #[error("transport stopped before the handshake completed")]
    HandshakeAborted,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Contrat commun aux transports (MQTT réel, broker mémoire)
pub trait MessageBus: Clone + Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<(), BusError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), BusError>> + Send;

    fn subscribe(&self, filter: &str) -> impl Future<Output = Result<(), BusError>> + Send;

    fn unsubscribe(&self, filter: &str) -> impl Future<Output = Result<(), BusError>> + Send;

    /// QoS at-least-once ; échoue immédiatement si le bus n'est pas connecté
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> impl Future<Output = Result<(), BusError>> + Send;

    fn is_connected(&self) -> bool;

    fn health(&self) -> BusHealth;
}
