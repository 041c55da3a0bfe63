//! Ephemeral network identity and telemetry of an emulated board

use breeze_kernel::models::DeviceType;
use rand::Rng;

/// OUI Espressif
const ESPRESSIF_OUI: [u8; 3] = [0x24, 0x0A, 0xC4];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkIdentity {
    pub ip: String,
    pub mac: String,
}

impl NetworkIdentity {
    /// New DHCP-like lease, regenerated on every (re)connection
    pub fn generate(rng: &mut impl Rng) -> Self {
        let ip = format!("192.168.1.{}", rng.random_range(100..=250u8));
        let tail: [u8; 3] = rng.random();
        let mac = ESPRESSIF_OUI
            .iter()
            .chain(tail.iter())
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");
        Self { ip, mac }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Telemetry {
    pub wifi_strength: i64,
    pub free_heap: u64,
}

impl Telemetry {
    pub fn baseline(device_type: DeviceType) -> Self {
        let free_heap = match device_type {
            DeviceType::Esp8266 => 42_000,
            DeviceType::Esp32S3 => 310_000,
            DeviceType::Esp32C3 => 160_000,
            DeviceType::Esp32 | DeviceType::Unknown => 220_000,
        };
        Self { wifi_strength: -58, free_heap }
    }

    /// Petite marche aléatoire bornée entre deux rapports de status
    pub fn jitter(&mut self, rng: &mut impl Rng, device_type: DeviceType) {
        let base = Self::baseline(device_type);
        self.wifi_strength = (self.wifi_strength + rng.random_range(-3..=3)).clamp(-90, -30);

        let drift = rng.random_range(-2048i64..=2048);
        let low = base.free_heap * 8 / 10;
        let high = base.free_heap * 11 / 10;
        self.free_heap = self.free_heap.saturating_add_signed(drift).clamp(low, high);
    }
}
