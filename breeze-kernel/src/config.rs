use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

use crate::bus::MqttSettings;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub namespace: String,
    pub mqtt: MqttConf,
    pub http: HttpConf,
    pub autopilot: AutopilotConf,
    /// Filtres MQTT ; vide = `{namespace}/#`
    pub subscriptions: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AutopilotConf {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            namespace: "breeze".into(),
            mqtt: MqttConf::default(),
            http: HttpConf::default(),
            autopilot: AutopilotConf::default(),
            subscriptions: Vec::new(),
        }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: None,
            keep_alive_secs: 15,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0".into(), port: 8080 }
    }
}

impl Default for AutopilotConf {
    fn default() -> Self {
        Self { enabled: false, interval_secs: 20 }
    }
}

impl KernelConfig {
    pub fn subscription_filters(&self) -> Vec<String> {
        if self.subscriptions.is_empty() {
            vec![format!("{}/#", self.namespace)]
        } else {
            self.subscriptions.clone()
        }
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        let client_id = self
            .mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("breeze-kernel-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
        let mut settings = MqttSettings::new(&client_id, &self.mqtt.host, self.mqtt.port);
        settings.keep_alive = Duration::from_secs(self.mqtt.keep_alive_secs.max(1));
        settings.connect_timeout = Duration::from_secs(self.mqtt.connect_timeout_secs.max(1));
        settings
    }

    /// Variables d'environnement prioritaires sur le fichier
    pub fn apply_env_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(host) = get("BREEZE_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = get("BREEZE_MQTT_PORT") {
            match port.parse() {
                Ok(port) => self.mqtt.port = port,
                Err(_) => warn!("[config] BREEZE_MQTT_PORT invalide: {port}"),
            }
        }
        if let Some(ns) = get("BREEZE_NAMESPACE") {
            self.namespace = ns;
        }
        if let Some(port) = get("BREEZE_HTTP_PORT") {
            match port.parse() {
                Ok(port) => self.http.port = port,
                Err(_) => warn!("[config] BREEZE_HTTP_PORT invalide: {port}"),
            }
        }
    }
}

pub fn parse_config(txt: &str) -> KernelConfig {
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(txt).unwrap_or_else(|e| {
        warn!("[config] config invalide: {e}");
        KernelConfig::default()
    })
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("BREEZE_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        info!("[config] loaded {}", path);
        parse_config(&txt)
    } else {
        warn!("[config] pas de {}, usage config par défaut", path);
        KernelConfig::default()
    };
    cfg.apply_env_overrides(|key| std::env::var(key).ok());
    cfg
}
