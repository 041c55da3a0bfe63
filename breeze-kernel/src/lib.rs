/**
 * BREEZE KERNEL - Registre des devices ESP32 et passerelle MQTT
 *
 * RÔLE : tenir à jour la vue des devices à partir des messages MQTT
 * (discovery / status / state) et relayer les commandes du dashboard.
 *
 * ARCHITECTURE : bus (transport) → reconciler → registry ← http / autopilot → dispatcher → bus
 */

pub mod autopilot;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod health;
pub mod http;
pub mod models;
pub mod payload;
pub mod reconciler;
pub mod registry;
pub mod topic;
