/**
 * BREEZE KERNEL - Point d'entrée du serveur
 *
 * RÔLE : config, connexion MQTT, reconciler, autopilot éventuel, API HTTP.
 * Le kernel démarre même sans broker : la connexion est retentée en boucle
 * et l'API sert le registre (vide) en attendant.
 */

use anyhow::Context;
use breeze_kernel::autopilot::spawn_autopilot;
use breeze_kernel::bus::{MessageBus, MqttBus};
use breeze_kernel::config::{load_config, KernelConfig};
use breeze_kernel::dispatcher::CommandDispatcher;
use breeze_kernel::http::{build_router, AppState};
use breeze_kernel::reconciler::Reconciler;
use breeze_kernel::registry::DeviceRegistry;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;
    info!("[kernel] namespace '{}', broker {}:{}", cfg.namespace, cfg.mqtt.host, cfg.mqtt.port);

    let registry = DeviceRegistry::new();
    let (bus, events) = MqttBus::new(cfg.mqtt_settings());

    // reconciler avant la connexion pour ne rien perdre des messages retenus
    let reconciler = Reconciler::new(registry.clone());
    tokio::spawn(async move { reconciler.run(events).await });

    tokio::spawn(connect_and_subscribe(bus.clone(), cfg.clone()));

    let dispatcher = CommandDispatcher::new(bus.clone(), registry.clone(), &cfg.namespace);

    if cfg.autopilot.enabled {
        spawn_autopilot(
            dispatcher.clone(),
            registry.clone(),
            Duration::from_secs(cfg.autopilot.interval_secs.max(1)),
        );
    }

    let app = build_router(AppState::new(registry, dispatcher));
    let addr = format!("{}:{}", cfg.http.bind, cfg.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("[kernel] listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server stopped")?;

    if let Err(e) = bus.disconnect().await {
        warn!("[kernel] disconnect failed: {e}");
    }
    info!("[kernel] bye");
    Ok(())
}

/// Retente la connexion initiale ; les reconnexions suivantes sont gérées par le bus
async fn connect_and_subscribe(bus: MqttBus, cfg: KernelConfig) {
    let retry = Duration::from_secs(5);
    loop {
        match bus.connect().await {
            Ok(()) => break,
            Err(e) => {
                error!("[kernel] mqtt connect failed: {e}, retry in {:?}", retry);
                tokio::time::sleep(retry).await;
            }
        }
    }

    for filter in cfg.subscription_filters() {
        match bus.subscribe(&filter).await {
            Ok(()) => info!("[kernel] subscribed to {filter}"),
            Err(e) => error!("[kernel] subscribe {filter} failed: {e}"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("[kernel] ctrl_c handler failed: {e}");
    }
    info!("[kernel] shutting down");
}
