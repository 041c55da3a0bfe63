//! Emulator configuration
//!
//! Loaded from `BREEZE_EMULATOR_CONFIG` or the OS config dir
//! (`breeze-emulator/config.toml`). Every section is optional.

use anyhow::{Context, Result};
use breeze_kernel::models::{DeviceType, PowerState};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub namespace: String,
    pub mqtt: MqttConfig,
    pub devices: Vec<DeviceProfile>,
    pub timing: TimingConfig,
    pub auto_mode: AutoModeConfig,
    /// Snapshots JSON des devices online ; désactivé si absent
    pub signal_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub device_type: DeviceType,
    #[serde(default = "default_firmware")]
    pub firmware: String,
    #[serde(default)]
    pub initial_state: PowerState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub status_interval_secs: u64,
    pub reconnect_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoModeConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Probabilité par tick de basculer on/off
    pub toggle_probability: f64,
    /// Probabilité par tick de simuler une coupure
    pub flap_probability: f64,
    pub flap_offline_secs: u64,
}

fn default_firmware() -> String {
    "1.0.0".to_string()
}

impl DeviceProfile {
    pub fn new(id: &str, device_type: DeviceType) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            device_type,
            firmware: default_firmware(),
            initial_state: PowerState::Off,
        }
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| breeze_kernel::models::default_name(&self.id))
    }
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            namespace: "breeze".to_string(),
            mqtt: MqttConfig::default(),
            devices: vec![
                DeviceProfile {
                    name: Some("Living Room Lamp".to_string()),
                    ..DeviceProfile::new("esp32-001", DeviceType::Esp32)
                },
                DeviceProfile {
                    name: Some("Kitchen Plug".to_string()),
                    ..DeviceProfile::new("esp8266-001", DeviceType::Esp8266)
                },
            ],
            timing: TimingConfig::default(),
            auto_mode: AutoModeConfig::default(),
            signal_dir: None,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            keep_alive_secs: 15,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: 30,
            reconnect_delay_secs: 5,
        }
    }
}

impl Default for AutoModeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 15,
            toggle_probability: 0.3,
            flap_probability: 0.05,
            flap_offline_secs: 20,
        }
    }
}

impl TimingConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs.max(1))
    }
}

impl AutoModeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn flap_offline(&self) -> Duration {
        Duration::from_secs(self.flap_offline_secs)
    }
}

impl EmulatorConfig {
    /// Load config from `BREEZE_EMULATOR_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            Self::parse(&content).with_context(|| format!("Invalid config {}", config_path.display()))?
        } else {
            Self::default()
        };

        if let Ok(device_id) = std::env::var("BREEZE_DEVICE_ID") {
            config.single_device(&device_id);
        }
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(Into::into)
    }

    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("BREEZE_EMULATOR_CONFIG") {
            return Ok(PathBuf::from(path));
        }

        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("breeze-emulator");
        path.push("config.toml");
        Ok(path)
    }

    /// Ne garde qu'un device : le profil existant s'il est connu, sinon un ESP32 par défaut
    pub fn single_device(&mut self, device_id: &str) {
        let profile = self
            .devices
            .iter()
            .find(|p| p.id == device_id)
            .cloned()
            .unwrap_or_else(|| DeviceProfile::new(device_id, DeviceType::Esp32));
        self.devices = vec![profile];
    }
}
