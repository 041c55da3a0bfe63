/**
 * AUTOPILOT - Mode démo : bascule périodique d'un device online tiré au hasard
 *
 * Passe par le dispatcher comme une commande manuelle : l'état n'est mis à jour
 * qu'au retour du message state du device.
 */

use crate::bus::MessageBus;
use crate::dispatcher::CommandDispatcher;
use crate::models::{DeviceRecord, DeviceStatus};
use crate::registry::DeviceRegistry;
use rand::seq::IndexedRandom;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub fn pick_target(devices: &[DeviceRecord]) -> Option<String> {
    let online: Vec<&DeviceRecord> = devices.iter().filter(|d| d.status == DeviceStatus::Online).collect();
    let mut rng = rand::rng();
    online.choose(&mut rng).map(|d| d.id.clone())
}

pub async fn tick<B: MessageBus>(dispatcher: &CommandDispatcher<B>, registry: &DeviceRegistry) -> Option<String> {
    let target = pick_target(&registry.list())?;
    match dispatcher.toggle(&target).await {
        Ok(requested) => {
            info!("[autopilot] asked {} to switch {}", target, requested);
            Some(target)
        }
        Err(e) => {
            warn!("[autopilot] toggle of {} failed: {}", target, e);
            None
        }
    }
}

pub fn spawn_autopilot<B: MessageBus>(
    dispatcher: CommandDispatcher<B>,
    registry: DeviceRegistry,
    interval: Duration,
) -> JoinHandle<()> {
    info!("[autopilot] enabled, toggling a random device every {:?}", interval);
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await;
        loop {
            timer.tick().await;
            if tick(&dispatcher, &registry).await.is_none() {
                debug!("[autopilot] nothing toggled this round");
            }
        }
    })
}
