//! Breeze Emulator - runs the configured fleet against a real MQTT broker
//!
//! One MQTT session per device, each with a last will `{online:false}` on its
//! status topic so the kernel sees abrupt disconnects.

use anyhow::{Context, Result};
use breeze_emulator::config::EmulatorConfig;
use breeze_emulator::device::{EmulatedDevice, StatusMessage};
use breeze_emulator::runner::run_device;
use breeze_kernel::bus::{MqttBus, MqttSettings};
use breeze_kernel::topic::{device_topic, MessageKind};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EmulatorConfig::load().await.context("Failed to load emulator config")?;
    info!(
        "Starting {} emulated device(s) on mqtt://{}:{} (namespace '{}')",
        config.devices.len(),
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.namespace
    );
    if config.devices.is_empty() {
        anyhow::bail!("No devices configured");
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let last_will = serde_json::to_vec(&StatusMessage::offline()).context("Failed to encode last will")?;
    let mut handles = Vec::new();

    for profile in config.devices.clone() {
        let client_id = format!("breeze-emu-{}-{}", profile.id, &uuid::Uuid::new_v4().simple().to_string()[..6]);
        let will_topic = device_topic(&config.namespace, &profile.id, &MessageKind::Status);

        let mut settings = MqttSettings::new(&client_id, &config.mqtt.broker_host, config.mqtt.broker_port)
            .with_last_will(&will_topic, last_will.clone());
        settings.keep_alive = Duration::from_secs(config.mqtt.keep_alive_secs.max(1));
        settings.connect_timeout = Duration::from_secs(config.mqtt.connect_timeout_secs.max(1));

        let (bus, events) = MqttBus::new(settings);
        let device = EmulatedDevice::new(profile, &config.namespace, bus).with_signal_dir(config.signal_dir.clone());

        handles.push(tokio::spawn(run_device(
            device,
            events,
            config.timing.clone(),
            config.auto_mode.clone(),
            stop_rx.clone(),
        )));
    }

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl_c")?;
    info!("Shutdown requested, taking devices offline");
    stop_tx.send(true).ok();

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Device task crashed: {}", e);
        }
    }
    info!("Emulator stopped");
    Ok(())
}
