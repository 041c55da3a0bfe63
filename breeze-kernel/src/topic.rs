/**
 * TOPICS MQTT - Parsing et construction des topics Breeze
 *
 * FORMATS ACCEPTÉS :
 * - actuel : {ns}/devices/{id}/{kind}      (ex: breeze/devices/esp32-001/status)
 * - legacy : {ns}/{id}/{kind}              (ex: breeze/esp32-001/status)
 * - commandes : {ns}/devices/{id}/command/{name}
 *
 * Le deuxième segment décide du format : s'il vaut littéralement "devices",
 * l'id est le troisième segment, sinon c'est le deuxième.
 */

use std::fmt;

pub const DEVICES_SEGMENT: &str = "devices";
pub const COMMAND_SEGMENT: &str = "command";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Discovery,
    Status,
    State,
    Command(String),
    /// Suffixe ad-hoc publié par certains firmwares
    Other(String),
}

impl MessageKind {
    fn from_segment(segment: &str) -> Self {
        match segment {
            "discovery" => MessageKind::Discovery,
            "status" => MessageKind::Status,
            "state" => MessageKind::State,
            other => MessageKind::Other(other.to_string()),
        }
    }

    pub fn suffix(&self) -> String {
        match self {
            MessageKind::Discovery => "discovery".into(),
            MessageKind::Status => "status".into(),
            MessageKind::State => "state".into(),
            MessageKind::Command(name) => format!("{COMMAND_SEGMENT}/{name}"),
            MessageKind::Other(suffix) => suffix.clone(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.suffix())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub namespace: String,
    pub device_id: String,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic '{0}' has fewer than 3 segments")]
    TooFewSegments(String),
    #[error("topic '{0}' has an empty device id")]
    EmptyDeviceId(String),
    #[error("topic '{0}' has no message kind after the device id")]
    MissingKind(String),
    #[error("topic '{0}' ends with an empty message kind")]
    EmptyKind(String),
    #[error("topic '{0}' has a command segment without a command name")]
    MissingCommandName(String),
}

pub fn parse_topic(topic: &str) -> Result<ParsedTopic, TopicError> {
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() < 3 {
        return Err(TopicError::TooFewSegments(topic.to_string()));
    }

    let id_index = if segments[1] == DEVICES_SEGMENT { 2 } else { 1 };
    let device_id = segments[id_index];
    if device_id.is_empty() {
        return Err(TopicError::EmptyDeviceId(topic.to_string()));
    }

    // un segment "command" après l'id rend le message command-class, où qu'il soit
    let rest = &segments[id_index + 1..];
    let kind = match rest.iter().position(|segment| *segment == COMMAND_SEGMENT) {
        Some(pos) => match rest.get(pos + 1) {
            Some(name) if !name.is_empty() => MessageKind::Command(name.to_string()),
            _ => return Err(TopicError::MissingCommandName(topic.to_string())),
        },
        None => match rest {
            [] => return Err(TopicError::MissingKind(topic.to_string())),
            [.., ""] => return Err(TopicError::EmptyKind(topic.to_string())),
            [.., last] => MessageKind::from_segment(last),
        },
    };

    Ok(ParsedTopic {
        namespace: segments[0].to_string(),
        device_id: device_id.to_string(),
        kind,
    })
}

pub fn device_topic(namespace: &str, device_id: &str, kind: &MessageKind) -> String {
    format!("{namespace}/{DEVICES_SEGMENT}/{device_id}/{}", kind.suffix())
}

pub fn command_topic(namespace: &str, device_id: &str, command: &str) -> String {
    device_topic(namespace, device_id, &MessageKind::Command(command.to_string()))
}

/// Filtre couvrant toutes les commandes adressées à un device
pub fn command_filter(namespace: &str, device_id: &str) -> String {
    format!("{namespace}/{DEVICES_SEGMENT}/{device_id}/{COMMAND_SEGMENT}/+")
}

/// Matching des filtres MQTT (`+` = un niveau, `#` = tous les niveaux restants)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    rumqttc::matches(topic, filter)
}
