use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// What survives a reload: ids only, never media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedParticipant {
    pub id: String,
    #[serde(default)]
    pub is_local: bool,
}

/// Durable per-room participant lists.
pub trait SessionStore: Send + Sync {
    fn load(&self, room_id: &str) -> Result<Option<Vec<PersistedParticipant>>>;
    fn save(&self, room_id: &str, participants: &[PersistedParticipant]) -> Result<()>;
    fn remove(&self, room_id: &str) -> Result<()>;
}

pub fn room_key(room_id: &str) -> String {
    let safe: String = room_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("study-room-{safe}")
}

/// One JSON file per room under a state directory.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, room_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", room_key(room_id)))
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, room_id: &str) -> Result<Option<Vec<PersistedParticipant>>> {
        match fs::read(self.path(room_id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, room_id: &str, participants: &[PersistedParticipant]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(room_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(participants)?)?;
        fs::rename(&tmp, &path)?;
        debug!(room_id, count = participants.len(), "room session saved");
        Ok(())
    }

    fn remove(&self, room_id: &str) -> Result<()> {
        match fs::remove_file(self.path(room_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local store, for ephemeral sessions and tests.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.entries.lock().contains_key(&room_key(room_id))
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, room_id: &str) -> Result<Option<Vec<PersistedParticipant>>> {
        match self.entries.lock().get(&room_key(room_id)) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    fn save(&self, room_id: &str, participants: &[PersistedParticipant]) -> Result<()> {
        let json = serde_json::to_string(participants)?;
        self.entries.lock().insert(room_key(room_id), json);
        Ok(())
    }

    fn remove(&self, room_id: &str) -> Result<()> {
        self.entries.lock().remove(&room_key(room_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<PersistedParticipant> {
        vec![
            PersistedParticipant {
                id: "u1".into(),
                is_local: true,
            },
            PersistedParticipant {
                id: "u2".into(),
                is_local: false,
            },
        ]
    }

    #[test]
    fn persisted_layout_is_id_and_local_flag() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{ "id": "u1", "isLocal": true }, { "id": "u2", "isLocal": false }])
        );
        let parsed: Vec<PersistedParticipant> = serde_json::from_str(r#"[{"id":"u3"}]"#).unwrap();
        assert!(!parsed[0].is_local);
    }

    #[test]
    fn room_keys_are_filesystem_safe() {
        assert_eq!(room_key("r1"), "study-room-r1");
        assert_eq!(room_key("../etc/passwd"), "study-room-___etc_passwd");
    }

    #[test]
    fn file_store_round_trip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("state"));

        assert!(store.load("r1").unwrap().is_none());
        store.save("r1", &sample()).unwrap();
        assert_eq!(store.load("r1").unwrap().unwrap(), sample());
        assert!(store.load("r2").unwrap().is_none());

        store.remove("r1").unwrap();
        assert!(store.load("r1").unwrap().is_none());
        store.remove("r1").unwrap();
    }

    #[test]
    fn corrupt_files_surface_as_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        fs::write(dir.path().join("study-room-r1.json"), b"{oops").unwrap();
        assert!(store.load("r1").is_err());
    }

    #[test]
    fn memory_store_tracks_entries() {
        let store = MemorySessionStore::new();
        store.save("r1", &sample()).unwrap();
        assert!(store.contains("r1"));
        assert_eq!(store.load("r1").unwrap().unwrap().len(), 2);
        store.remove("r1").unwrap();
        assert!(!store.contains("r1"));
    }
}
