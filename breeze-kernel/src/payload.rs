/**
 * PAYLOADS ENTRANTS - Décodage tolérant + extraction typée des champs
 *
 * Les firmwares publient soit du JSON objet, soit du texte brut ("ON", "off", ...).
 * Tout payload est ramené à une map clé/valeur non typée, puis chaque champ est
 * extrait avec un type attendu : une valeur du mauvais type est ignorée (warn), jamais propagée.
 */

use serde_json::{Map, Value};
use tracing::warn;

pub type Payload = Map<String, Value>;

pub const RAW_MESSAGE_KEY: &str = "raw_message";

/// JSON objet si possible, sinon texte brut enveloppé dans `raw_message`
pub fn decode_payload(raw: &[u8]) -> Payload {
    let text = match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(map)) => return map,
        Ok(Value::String(s)) => s,
        _ => String::from_utf8_lossy(raw).into_owned(),
    };

    let mut payload = Payload::new();
    let lowered = text.trim().to_ascii_lowercase();
    if lowered == "on" || lowered == "off" {
        payload.insert("state".into(), Value::String(lowered));
    }
    payload.insert(RAW_MESSAGE_KEY.into(), Value::String(text));
    payload
}

pub fn expect_str(payload: &Payload, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => {
            warn!("[payload] field '{}' expected a string, got {}", key, other);
            None
        }
    }
}

/// Premier champ texte présent parmi des alias (`firmware` / `firmware_version`...)
pub fn expect_str_any(payload: &Payload, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| expect_str(payload, key))
}

pub fn expect_bool(payload: &Payload, key: &str) -> Option<bool> {
    match payload.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::Null => None,
        other => {
            warn!("[payload] field '{}' expected a boolean, got {}", key, other);
            None
        }
    }
}

pub fn expect_i64(payload: &Payload, key: &str) -> Option<i64> {
    match payload.get(key)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64)),
        Value::Null => None,
        other => {
            warn!("[payload] field '{}' expected a number, got {}", key, other);
            None
        }
    }
}

/// Entier non négatif ; un nombre négatif est rejeté comme une erreur de type
pub fn expect_u64(payload: &Payload, key: &str) -> Option<u64> {
    match payload.get(key)? {
        Value::Number(n) => {
            let value = n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64));
            if value.is_none() {
                warn!("[payload] field '{}' expected a non-negative number, got {}", key, n);
            }
            value
        }
        Value::Null => None,
        other => {
            warn!("[payload] field '{}' expected a number, got {}", key, other);
            None
        }
    }
}

/// Le payload porte-t-il des champs d'identité (id / name / type) ?
pub fn has_identity_fields(payload: &Payload) -> bool {
    ["id", "name", "type"].iter().any(|key| payload.contains_key(*key))
}
