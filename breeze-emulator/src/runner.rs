//! Event loop of one emulated device: bus events, status timer, auto mode, shutdown

use crate::config::{AutoModeConfig, TimingConfig};
use crate::device::{EmulatedDevice, LinkState};
use breeze_kernel::bus::{BusEvents, MessageBus};
use rand::Rng;
use tokio::sync::watch;
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Décision du mode auto pour un tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoAction {
    Idle,
    Toggle,
    Flap,
}

pub fn roll_auto_action(rng: &mut impl Rng, auto: &AutoModeConfig) -> AutoAction {
    let roll: f64 = rng.random();
    if roll < auto.flap_probability {
        AutoAction::Flap
    } else if roll < auto.flap_probability + auto.toggle_probability {
        AutoAction::Toggle
    } else {
        AutoAction::Idle
    }
}

pub async fn run_device<B: MessageBus>(
    mut device: EmulatedDevice<B>,
    mut events: BusEvents,
    timing: TimingConfig,
    auto: AutoModeConfig,
    mut shutdown: watch::Receiver<bool>,
) -> EmulatedDevice<B> {
    let mut status_timer = interval(timing.status_interval());
    status_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    status_timer.tick().await;

    let mut auto_timer = interval(auto.interval());
    auto_timer.tick().await;

    // premier go_online immédiat, puis retentatives
    let mut rejoin_at: Option<Instant> = Some(Instant::now());

    loop {
        let rejoin_deadline = rejoin_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = events.recv() => match event {
                Some(event) => device.handle_bus_event(event).await,
                None => {
                    warn!("[{}] bus event channel closed", device.id());
                    break;
                }
            },
            _ = status_timer.tick() => {
                if let Err(e) = device.status_tick().await {
                    warn!("[{}] status not sent: {}", device.id(), e);
                }
            }
            _ = auto_timer.tick(), if auto.enabled => {
                let action = roll_auto_action(&mut rand::rng(), &auto);
                match action {
                    AutoAction::Idle => {}
                    AutoAction::Toggle => {
                        if let Err(e) = device.auto_toggle().await {
                            warn!("[{}] auto toggle failed: {}", device.id(), e);
                        }
                    }
                    AutoAction::Flap if device.link() == LinkState::Online => {
                        info!("[{}] auto mode: dropping off for {:?}", device.id(), auto.flap_offline());
                        if let Err(e) = device.go_offline().await {
                            warn!("[{}] go_offline failed: {}", device.id(), e);
                        }
                        rejoin_at = Some(Instant::now() + auto.flap_offline());
                    }
                    AutoAction::Flap => {}
                }
            }
            _ = sleep_until(rejoin_deadline), if rejoin_at.is_some() => {
                rejoin_at = None;
                if let Err(e) = device.go_online().await {
                    debug!("[{}] retrying in {:?}: {}", device.id(), timing.reconnect_delay(), e);
                    rejoin_at = Some(Instant::now() + timing.reconnect_delay());
                }
            }
        }
    }

    if let Err(e) = device.go_offline().await {
        warn!("[{}] clean shutdown failed: {}", device.id(), e);
    }
    device
}
