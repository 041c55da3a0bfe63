use crate::registry::{DeviceRegistry, RegistrySummary};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusHealth {
    pub state: ConnectionState,
    pub reconnects: u32,
    pub messages_received: u64,
    pub messages_sent: u64,
}

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub devices: RegistrySummary,
    pub memory_usage_mb: f32,
    pub bus: BusHealth,
}

/// Compteurs de connexion partagés entre le driver du transport et les lecteurs
#[derive(Clone, Debug)]
pub struct HealthTracker {
    state: Arc<Mutex<ConnectionState>>,
    reconnects: Arc<AtomicU32>,
    received: Arc<AtomicU64>,
    sent: Arc<AtomicU64>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            reconnects: Arc::new(AtomicU32::new(0)),
            received: Arc::new(AtomicU64::new(0)),
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn mark_connecting(&self) {
        *self.state.lock() = ConnectionState::Connecting;
    }

    pub fn mark_connected(&self) {
        *self.state.lock() = ConnectionState::Connected;
    }

    pub fn mark_disconnected(&self) {
        *self.state.lock() = ConnectionState::Disconnected;
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        *self.state.lock() = ConnectionState::Reconnecting;
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BusHealth {
        BusHealth {
            state: self.state(),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            messages_sent: self.sent.load(Ordering::Relaxed),
        }
    }
}

pub fn kernel_health(started: Instant, registry: &DeviceRegistry, bus: BusHealth) -> KernelHealth {
    KernelHealth {
        uptime_seconds: started.elapsed().as_secs(),
        devices: registry.summary(),
        memory_usage_mb: get_memory_usage_mb(),
        bus,
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb) = line.split_whitespace().nth(1).and_then(|kb| kb.parse::<u64>().ok()) {
                        return (kb as f32) / 1024.0;
                    }
                }
            }
        }
    }

    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_transitions() {
        let tracker = HealthTracker::new();
        assert_eq!(tracker.state(), ConnectionState::Disconnected);

        tracker.mark_connecting();
        tracker.mark_connected();
        assert!(tracker.is_connected());

        tracker.increment_reconnects();
        assert_eq!(tracker.state(), ConnectionState::Reconnecting);
        assert!(!tracker.is_connected());

        tracker.record_sent();
        tracker.record_received();
        tracker.record_received();
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.reconnects, 1);
        assert_eq!(snapshot.messages_sent, 1);
        assert_eq!(snapshot.messages_received, 2);
    }

    #[test]
    fn kernel_health_reports_registry() {
        let registry = DeviceRegistry::new();
        registry.upsert_from_discovery("esp32-001", &Default::default());
        let health = kernel_health(Instant::now(), &registry, HealthTracker::new().snapshot());
        assert_eq!(health.devices.total, 1);
        assert_eq!(health.devices.online, 1);
        assert_eq!(health.bus.state, ConnectionState::Disconnected);
    }
}
