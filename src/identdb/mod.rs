//! Radio-id identity snapshot service.
//!
//! The global amateur radio-id directory maps user ids to callsigns. The
//! server consults it to reject impostor logins when a hotspot announces a
//! callsign that does not belong to its id.
//!
//! The snapshot is loaded explicitly at startup and swapped atomically on
//! reload; readers hold a reference to the active snapshot. There is no
//! lazy init on first read.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Inclusive range of valid 7-digit user ids.
pub const USER_ID_MIN: u32 = 1_000_000;
pub const USER_ID_MAX: u32 = 9_999_999;

/// One entry of the radio-id directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioUser {
    pub id: u32,
    pub callsign: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub country: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotFile {
    users: Vec<RadioUser>,
}

/// The identity snapshot service.
pub struct IdentDb {
    snapshot: RwLock<Arc<HashMap<u32, RadioUser>>>,
}

impl IdentDb {
    /// Create an empty service (callsign checks are permissive).
    pub fn empty() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Load a snapshot from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Self::empty();
        db.reload(path)?;
        Ok(db)
    }

    /// Re-read the snapshot and swap it in atomically.
    pub fn reload<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read identity snapshot: {e}")))?;

        let file: SnapshotFile = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse identity snapshot: {e}")))?;

        let mut map = HashMap::with_capacity(file.users.len());
        for user in file.users {
            map.insert(user.id, user);
        }
        let count = map.len();

        *self.snapshot.write() = Arc::new(map);

        info!("Loaded {count} radio ids from identity snapshot");
        Ok(count)
    }

    /// Number of known users.
    pub fn len(&self) -> usize {
        self.snapshot.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.read().is_empty()
    }

    /// Look up a user by id.
    pub fn get(&self, id: u32) -> Option<RadioUser> {
        self.snapshot.read().get(&id).cloned()
    }

    /// Check that an id is a plausible 7-digit user id.
    pub fn is_valid_user(&self, id: u32) -> bool {
        (USER_ID_MIN..=USER_ID_MAX).contains(&id)
    }

    /// Verify that a callsign belongs to an id.
    ///
    /// Permissive when the id is not in the snapshot (admission is gated by
    /// the registry, not the directory); strict when it is.
    pub fn callsign_matches(&self, id: u32, callsign: &str) -> bool {
        match self.snapshot.read().get(&id) {
            Some(user) => user.callsign.eq_ignore_ascii_case(callsign),
            None => true,
        }
    }
}

impl Default for IdentDb {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn snapshot_file(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_and_lookup() {
        let file = snapshot_file(
            r#"{"users": [
                {"id": 3107001, "callsign": "W1AW", "name": "Hiram", "country": "United States"},
                {"id": 2341001, "callsign": "G4KLX", "country": "United Kingdom"}
            ]}"#,
        );

        let db = IdentDb::load(file.path()).unwrap();
        assert_eq!(db.len(), 2);
        assert_eq!(db.get(3107001).unwrap().callsign, "W1AW");
        assert!(db.get(1111111).is_none());
    }

    #[test]
    fn test_user_id_range() {
        let db = IdentDb::empty();
        assert!(db.is_valid_user(1000000));
        assert!(db.is_valid_user(9999999));
        assert!(!db.is_valid_user(999999));
        assert!(!db.is_valid_user(10000000));
    }

    #[test]
    fn test_callsign_matching() {
        let file = snapshot_file(r#"{"users": [{"id": 3107001, "callsign": "W1AW"}]}"#);
        let db = IdentDb::load(file.path()).unwrap();

        assert!(db.callsign_matches(3107001, "W1AW"));
        assert!(db.callsign_matches(3107001, "w1aw"));
        assert!(!db.callsign_matches(3107001, "N0CALL"));
        // Ids the snapshot doesn't know are allowed through
        assert!(db.callsign_matches(2222222, "N0CALL"));
    }

    #[test]
    fn test_reload_swaps_snapshot() {
        let file = snapshot_file(r#"{"users": [{"id": 3107001, "callsign": "W1AW"}]}"#);
        let db = IdentDb::load(file.path()).unwrap();
        assert_eq!(db.len(), 1);

        let file2 = snapshot_file(
            r#"{"users": [
                {"id": 3107001, "callsign": "W1AW"},
                {"id": 2341001, "callsign": "G4KLX"}
            ]}"#,
        );
        let count = db.reload(file2.path()).unwrap();
        assert_eq!(count, 2);
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn test_bad_snapshot_is_rejected() {
        let file = snapshot_file("not json");
        assert!(IdentDb::load(file.path()).is_err());
    }
}
