/**
 * DISPATCH DES COMMANDES - kernel → device via {ns}/devices/{id}/command/{name}
 *
 * Une commande est une requête, pas une transition garantie : le registre ne bouge
 * que lorsque le device renvoie son message state. Pas de file d'attente ni de retry,
 * l'appelant décide.
 */

use crate::bus::{BusError, MessageBus};
use crate::models::PowerState;
use crate::registry::DeviceRegistry;
use crate::topic::command_topic;
use serde_json::{json, Value};
use tracing::{error, info};

pub const SET_STATE_COMMAND: &str = "set_state";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("bus is not connected")]
    NotConnected,
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("failed to serialize command payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("publish failed: {0}")]
    Bus(BusError),
}

impl From<BusError> for DispatchError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::NotConnected => DispatchError::NotConnected,
            other => DispatchError::Bus(other),
        }
    }
}

#[derive(Clone)]
pub struct CommandDispatcher<B> {
    bus: B,
    registry: DeviceRegistry,
    namespace: String,
}

impl<B: MessageBus> CommandDispatcher<B> {
    pub fn new(bus: B, registry: DeviceRegistry, namespace: &str) -> Self {
        Self {
            bus,
            registry,
            namespace: namespace.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// true si la commande a été remise au transport ; les échecs sont loggés
    pub async fn send_command(&self, device_id: &str, command: &str, payload: Value) -> bool {
        match self.try_send_command(device_id, command, payload).await {
            Ok(()) => true,
            Err(e) => {
                error!("[dispatch] command {} to {} failed: {}", command, device_id, e);
                false
            }
        }
    }

    pub async fn try_send_command(&self, device_id: &str, command: &str, payload: Value) -> Result<(), DispatchError> {
        if !self.bus.is_connected() {
            return Err(DispatchError::NotConnected);
        }
        if self.registry.get(device_id).is_none() {
            return Err(DispatchError::UnknownDevice(device_id.to_string()));
        }

        let topic = command_topic(&self.namespace, device_id, command);
        let bytes = serde_json::to_vec(&payload)?;
        self.bus.publish(&topic, bytes, false).await?;

        info!("[dispatch] sent {} to {}: {}", command, device_id, payload);
        Ok(())
    }

    pub async fn set_state(&self, device_id: &str, state: PowerState) -> bool {
        self.send_command(device_id, SET_STATE_COMMAND, json!({ "state": state })).await
    }

    /// Demande l'état inverse de celui connu du registre ; renvoie l'état demandé
    pub async fn toggle(&self, device_id: &str) -> Result<PowerState, DispatchError> {
        let current = self
            .registry
            .get(device_id)
            .ok_or_else(|| DispatchError::UnknownDevice(device_id.to_string()))?
            .state;
        let target = current.toggled();
        self.try_send_command(device_id, SET_STATE_COMMAND, json!({ "state": target }))
            .await?;
        Ok(target)
    }
}
