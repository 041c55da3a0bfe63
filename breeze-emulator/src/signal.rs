//! Signal files: `{signal_dir}/{id}.json` mirrors the state of an online device
//! for external watchers (scripts, dashboard demos).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub id: String,
    pub name: String,
    pub state: String,
    pub online: bool,
    pub ip: String,
    pub mac: String,
    pub updated_at: DateTime<Utc>,
}

pub fn signal_path(dir: &Path, device_id: &str) -> PathBuf {
    dir.join(format!("{device_id}.json"))
}

pub async fn write_signal(dir: &Path, snapshot: &SignalSnapshot) -> io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = signal_path(dir, &snapshot.id);
    let body = serde_json::to_vec_pretty(snapshot)?;
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

/// Absent file is not an error
pub async fn remove_signal(dir: &Path, device_id: &str) -> io::Result<()> {
    match tokio::fs::remove_file(signal_path(dir, device_id)).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> SignalSnapshot {
        SignalSnapshot {
            id: "esp32-001".into(),
            name: "Lamp".into(),
            state: "on".into(),
            online: true,
            ip: "192.168.1.120".into(),
            mac: "24:0A:C4:00:11:22".into(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn write_then_remove() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("signals");

        let path = write_signal(&nested, &snapshot()).await.unwrap();
        assert_eq!(path, nested.join("esp32-001.json"));

        let stored: SignalSnapshot = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(stored.state, "on");

        remove_signal(&nested, "esp32-001").await.unwrap();
        assert!(!path.exists());
        remove_signal(&nested, "esp32-001").await.unwrap();
    }
}
