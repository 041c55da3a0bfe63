/*!
Test Harness pour le kernel Breeze

Monte un kernel complet sur le broker mémoire:
- registre + reconciler abonné à `{ns}/#`, dispatcher prêt à l'emploi
- émulateurs lancés sur le même broker
- assertions sur les messages échangés et attente de l'état du registre
*/

use anyhow::Result;
use breeze_emulator::config::{AutoModeConfig, DeviceProfile, TimingConfig};
use breeze_emulator::device::EmulatedDevice;
use breeze_emulator::runner::run_device;
use breeze_kernel::bus::{BusEvents, MemoryBroker, MemoryBus, MessageBus};
use breeze_kernel::dispatcher::CommandDispatcher;
use breeze_kernel::models::DeviceRecord;
use breeze_kernel::reconciler::Reconciler;
use breeze_kernel::registry::DeviceRegistry;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const KERNEL_CLIENT: &str = "breeze-kernel";
const INJECTOR_CLIENT: &str = "devkit-injector";

/// Harness de test complet : broker mémoire + kernel câblé
pub struct TestHarness {
    pub broker: MemoryBroker,
    pub registry: DeviceRegistry,
    pub dispatcher: CommandDispatcher<MemoryBus>,
    injector: MemoryBus,
    namespace: String,
    reconciler_task: JoinHandle<()>,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

/// Émulateur lancé en tâche de fond
pub struct DeviceHandle {
    pub id: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<EmulatedDevice<MemoryBus>>,
}

impl DeviceHandle {
    /// Arrêt propre (go_offline) ; renvoie le device pour inspection
    pub async fn stop(self) -> Result<EmulatedDevice<MemoryBus>> {
        self.stop.send(true).ok();
        Ok(self.task.await?)
    }
}

impl TestHarness {
    /// Démarre le kernel de test sur le namespace `breeze`
    pub async fn start() -> Result<Self> {
        Self::with_namespace("breeze").await
    }

    pub async fn with_namespace(namespace: &str) -> Result<Self> {
        env_logger::try_init().ok();

        let broker = MemoryBroker::new();
        let registry = DeviceRegistry::new();

        let (kernel_bus, events) = broker.client(KERNEL_CLIENT);
        kernel_bus.connect().await?;
        kernel_bus.subscribe(&format!("{namespace}/#")).await?;

        let reconciler = Reconciler::new(registry.clone());
        let reconciler_task = tokio::spawn(async move { reconciler.run(events).await });

        let (injector, _injector_events) = broker.client(INJECTOR_CLIENT);
        injector.connect().await?;

        log::info!("🧪 Test kernel ready on namespace '{}'", namespace);
        Ok(Self {
            dispatcher: CommandDispatcher::new(kernel_bus, registry.clone(), namespace),
            broker,
            registry,
            injector,
            namespace: namespace.to_string(),
            reconciler_task,
            expectations: Vec::new(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Device émulé non démarré, avec son flux d'événements
    pub fn emulated_device(&self, profile: DeviceProfile) -> (EmulatedDevice<MemoryBus>, BusEvents) {
        let (bus, events) = self.broker.client(&profile.id);
        (EmulatedDevice::new(profile, &self.namespace, bus), events)
    }

    /// Lance un émulateur complet (boucle d'événements) sur le broker de test
    pub fn spawn_device(&self, profile: DeviceProfile, timing: TimingConfig) -> DeviceHandle {
        let id = profile.id.clone();
        let (device, events) = self.emulated_device(profile);
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_device(device, events, timing, AutoModeConfig::default(), stop_rx));
        log::info!("🤖 Spawned emulated device {}", id);
        DeviceHandle { id, stop, task }
    }

    /// Injecte un message JSON comme s'il venait d'un device
    pub async fn publish_json(&self, topic: &str, payload: &Value) -> Result<()> {
        self.publish_raw(topic, serde_json::to_vec(payload)?).await
    }

    pub async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.injector.publish(topic, payload, false).await?;
        log::info!("📨 Injected message on {}", topic);
        Ok(())
    }

    /// Attend que le device existe et satisfasse le prédicat
    pub async fn wait_for_device<F>(&self, device_id: &str, timeout_ms: u64, predicate: F) -> Result<DeviceRecord>
    where
        F: Fn(&DeviceRecord) -> bool,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(record) = self.registry.get(device_id) {
                if predicate(&record) {
                    log::info!("✅ Device {} reached expected state", device_id);
                    return Ok(record);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        anyhow::bail!(
            "Timeout waiting for device {} (current: {:?})",
            device_id,
            self.registry.get(device_id)
        );
    }

    /// Laisse le reconciler vider sa file
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Attend et vérifie qu'un message a été publié sur un topic
    pub async fn wait_for_message(&self, topic: &str, timeout_ms: u64) -> Result<Option<Value>> {
        let start = std::time::Instant::now();

        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(msg) = self.last_json(topic) {
                log::info!("✅ Received expected message on {}", topic);
                return Ok(Some(msg));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        log::warn!("⏰ Timeout waiting for message on {}", topic);
        Ok(None)
    }

    fn last_json(&self, topic: &str) -> Option<Value> {
        self.broker.published_on(topic).last().and_then(|msg| msg.json())
    }

    /// Ajoute une expectation: on s'attend à N messages publiés sur un topic
    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    /// Vérifie toutes les expectations configurées
    pub fn verify_expectations(&self) -> Result<()> {
        log::info!("🔍 Verifying {} expectations...", self.expectations.len());

        for expectation in &self.expectations {
            let actual_count = self.broker.published_on(&expectation.topic).len();
            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for topic '{}': expected {} messages, got {}",
                    expectation.topic,
                    expectation.expected_count,
                    actual_count
                );
            }
        }

        log::info!("🎉 All expectations verified successfully");
        Ok(())
    }

    /// Assert qu'un message spécifique a été publié
    pub fn assert_message_sent(&self, topic: &str, expected_payload: &Value) -> Result<()> {
        if self
            .broker
            .published_on(topic)
            .iter()
            .filter_map(|msg| msg.json())
            .any(|payload| payload == *expected_payload)
        {
            log::info!("✅ Found expected message on {}", topic);
            return Ok(());
        }

        anyhow::bail!("Expected message not found on topic: {}", topic);
    }

    /// Assert qu'un champ a une valeur spécifique dans le dernier message
    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        let Some(msg) = self.last_json(topic) else {
            anyhow::bail!("No JSON message on {}", topic);
        };

        match get_nested_field(&msg, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!("Field '{}' mismatch: expected {:?}, got {:?}", field_path, expected, actual),
            None => anyhow::bail!("Field '{}' not found for comparison in {}", field_path, topic),
        }
    }

    /// Stats sur les messages échangés
    pub fn get_stats(&self) -> TestStats {
        let messages = self.broker.published();
        let mut topic_counts = HashMap::new();

        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }

        TestStats {
            total_messages: messages.len(),
            topic_counts,
            devices: self.registry.len(),
        }
    }

    /// Reset journal et expectations (le registre est conservé)
    pub fn reset(&mut self) {
        self.broker.clear_log();
        self.expectations.clear();
        log::info!("🧹 Test harness reset");
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.reconciler_task.abort();
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(obj) => obj.get(part),
        _ => None,
    })
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub devices: usize,
}

impl TestStats {
    pub fn print(&self) {
        println!("📊 Test Statistics:");
        println!("  Total messages: {}", self.total_messages);
        for (topic, count) in &self.topic_counts {
            println!("    {}: {} messages", topic, count);
        }
        println!("  Devices in registry: {}", self.devices);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_builders::BreezeMessageBuilder;

    #[tokio::test]
    async fn test_harness_basic_functionality() {
        let mut harness = TestHarness::start().await.unwrap();
        let builder = BreezeMessageBuilder::new("breeze");
        let topic = builder.discovery_topic("esp32-001");

        harness.expect_messages(&topic, 1);
        let discovery = BreezeMessageBuilder::discovery("esp32-001", "Lamp", "ESP32");
        harness.publish_json(&topic, &discovery).await.unwrap();

        harness.verify_expectations().unwrap();
        harness.assert_message_sent(&topic, &discovery).unwrap();
        harness.assert_field_equals(&topic, "name", &Value::from("Lamp")).unwrap();
        assert!(harness.assert_field_equals(&topic, "name", &Value::from("Other")).is_err());

        let record = harness.wait_for_device("esp32-001", 1000, |_| true).await.unwrap();
        assert_eq!(record.name, "Lamp");

        let stats = harness.get_stats();
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.devices, 1);
    }

    #[test]
    fn nested_fields() {
        let value = serde_json::json!({"a": {"b": {"c": 3}}});
        assert_eq!(get_nested_field(&value, "a.b.c"), Some(&Value::from(3)));
        assert_eq!(get_nested_field(&value, "a.x"), None);
        assert_eq!(get_nested_field(&value, "a.b.c.d"), None);
    }
}
