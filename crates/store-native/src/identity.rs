//! Persisted writer identity.
//!
//! A writer instance must keep one stable id across restarts; sequence
//! numbering hangs off it. The id is stored as JSON in the app's own config
//! directory, never inside the sync directory (it names this device, not
//! the shared data).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use store_core::WriterId;

/// On-disk identity record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredIdentity {
    pub writer_id: WriterId,
    /// Unix timestamp ms of first generation
    pub created_at: u64,
}

/// Load the writer id from `path`, generating and persisting one if the
/// file is missing or unreadable.
pub fn load_or_generate(path: &Path) -> Result<WriterId> {
    if let Ok(contents) = fs::read_to_string(path) {
        if let Ok(identity) = serde_json::from_str::<StoredIdentity>(&contents) {
            return Ok(identity.writer_id);
        }
        tracing::warn!(?path, "unreadable identity file, generating a new id");
    }

    let identity = StoredIdentity {
        writer_id: WriterId::generate(),
        created_at: now_ms(),
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(&identity)?)?;
    Ok(identity.writer_id)
}

fn now_ms() -> u64 {
    use web_time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_then_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config/instance.json");

        let first = load_or_generate(&path).unwrap();
        assert!(path.exists());

        // Second load returns the same id
        let second = load_or_generate(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_file_regenerates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("instance.json");
        fs::write(&path, "{not json").unwrap();

        let id = load_or_generate(&path).unwrap();
        // File was replaced with a valid identity
        let reloaded = load_or_generate(&path).unwrap();
        assert_eq!(id, reloaded);
    }

    #[test]
    fn test_stored_identity_json_shape() {
        let identity = StoredIdentity {
            writer_id: WriterId::from(0xff),
            created_at: 1700000000000,
        };
        let json = serde_json::to_string(&identity).unwrap();
        assert!(json.contains("\"writer_id\":\"00000000000000ff\""));
        let parsed: StoredIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, identity);
    }
}
