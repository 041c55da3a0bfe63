/**
 * REGISTRE DES DEVICES - Source de vérité unique de l'état des devices
 *
 * RÔLE : Stockage mémoire des DeviceRecord indexés par id + logique de merge.
 *
 * FONCTIONNEMENT :
 * - Construit explicitement au démarrage puis injecté (reconciler, dispatcher, HTTP)
 * - Chaque mutation prend le verrou d'écriture pour toute la durée de la mise à jour :
 *   une mise à jour d'un record n'est jamais entrelacée avec une autre
 * - list() renvoie une copie triée par id, les écrivains continuent pendant l'itération
 */

use crate::models::{DeviceRecord, DeviceStatus, DeviceUpdate, PowerState};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("device not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub powered_on: usize,
}

#[derive(Clone)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<BTreeMap<String, DeviceRecord>>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self { devices: Arc::new(RwLock::new(BTreeMap::new())) }
    }

    /// Crée le record s'il est inconnu, sinon merge ; le status est forcé à online
    pub fn upsert_from_discovery(&self, id: &str, update: &DeviceUpdate) -> DeviceRecord {
        let now = OffsetDateTime::now_utc();
        let update = DeviceUpdate { status: Some(DeviceStatus::Online), ..update.clone() };

        let mut devices = self.devices.write();
        match devices.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.apply(&update, now);
                record.clone()
            }
            Entry::Vacant(entry) => {
                let mut record = DeviceRecord::new(id, now);
                record.apply(&update, now);
                info!("[registry] new device {} ({}, {})", id, record.name, record.device_type);
                entry.insert(record).clone()
            }
        }
    }

    pub fn merge_update(&self, id: &str, update: &DeviceUpdate) -> Result<DeviceRecord, RegistryError> {
        let now = OffsetDateTime::now_utc();
        let mut devices = self.devices.write();
        let record = devices
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        record.apply(update, now);
        Ok(record.clone())
    }

    /// Merge, ou création d'un record minimal si l'id est inconnu (status/state arrivés avant la discovery)
    pub fn merge_or_create(&self, id: &str, update: &DeviceUpdate) -> (DeviceRecord, bool) {
        let now = OffsetDateTime::now_utc();
        let mut devices = self.devices.write();
        let created = !devices.contains_key(id);
        let record = devices
            .entry(id.to_string())
            .or_insert_with(|| DeviceRecord::new(id, now));
        record.apply(update, now);
        if created {
            info!("[registry] created stub record for {}", id);
        }
        (record.clone(), created)
    }

    pub fn get(&self, id: &str) -> Option<DeviceRecord> {
        self.devices.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<DeviceRecord> {
        self.devices.read().values().cloned().collect()
    }

    /// Bascule on ↔ off
    pub fn toggle(&self, id: &str) -> Result<DeviceRecord, RegistryError> {
        let mut devices = self.devices.write();
        let record = devices
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        record.state = record.state.toggled();
        Ok(record.clone())
    }

    /// Suppression administrative
    pub fn remove(&self, id: &str) -> Option<DeviceRecord> {
        let removed = self.devices.write().remove(id);
        if removed.is_some() {
            info!("[registry] removed device {}", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    pub fn summary(&self) -> RegistrySummary {
        let devices = self.devices.read();
        let online = devices.values().filter(|d| d.status == DeviceStatus::Online).count();
        let powered_on = devices.values().filter(|d| d.state == PowerState::On).count();
        RegistrySummary {
            total: devices.len(),
            online,
            offline: devices.len() - online,
            powered_on,
        }
    }
}
