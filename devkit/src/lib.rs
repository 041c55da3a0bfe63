/*!
# Breeze DevKit - Harness de test bout-en-bout

Bibliothèque pour tester kernel et émulateurs ensemble sans broker:
- Broker mémoire + registre + reconciler câblés comme dans le kernel
- Émulateurs pilotés sur le même broker
- Builders de topics/payloads du protocole Breeze
- Assertions sur les messages publiés et l'état du registre
*/

pub mod message_builders;
pub mod test_utils;

pub use message_builders::BreezeMessageBuilder;
pub use test_utils::{DeviceHandle, TestHarness};
