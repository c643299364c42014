//! File-backed tier. One file per key-hash under `dir`; no global index —
//! enumeration is a directory scan, acceptable since invalidation/warming
//! are bulk operations (spec §4.C2).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    key: String,
    value: Vec<u8>,
    created_unix_s: u64,
    ttl_s: u64,
}

pub struct PersistentTier {
    dir: PathBuf,
    pub io_warnings: u64,
}

impl PersistentTier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let _ = std::fs::create_dir_all(&dir);
        Self { dir, io_warnings: 0 }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(blake3::hash(key.as_bytes()).to_hex().to_string())
    }

    /// On I/O error the entry is treated as a miss and a warning counter
    /// increments; the cache never raises to callers. Returns the entry's
    /// remaining TTL alongside its value so a promotion into the memory
    /// tier doesn't outlive the disk copy's own expiry.
    pub fn get(&mut self, key: &str) -> Option<(Vec<u8>, Duration)> {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(_) => {
                self.io_warnings += 1;
                return None;
            }
        };
        let entry: PersistedEntry = match bincode::deserialize(&bytes) {
            Ok(e) => e,
            Err(_) => {
                self.io_warnings += 1;
                return None;
            }
        };
        if entry.key != key {
            return None;
        }
        let now = now_unix();
        let age = now.saturating_sub(entry.created_unix_s);
        if age >= entry.ttl_s {
            let _ = std::fs::remove_file(&path);
            return None;
        }
        let remaining = Duration::from_secs(entry.ttl_s - age);
        Some((entry.value, remaining))
    }

    pub fn set(&mut self, key: &str, value: Vec<u8>, ttl: Duration) {
        let entry = PersistedEntry {
            key: key.to_string(),
            value,
            created_unix_s: now_unix(),
            ttl_s: ttl.as_secs(),
        };
        let Ok(bytes) = bincode::serialize(&entry) else {
            self.io_warnings += 1;
            return;
        };
        if std::fs::write(self.path_for(key), bytes).is_err() {
            self.io_warnings += 1;
        }
    }

    pub fn remove(&mut self, key: &str) {
        let _ = std::fs::remove_file(self.path_for(key));
    }

    /// Enumeration is by directory scan: acceptable because invalidation is
    /// a bulk, infrequent operation.
    pub fn invalidate_pattern(&mut self, pattern: &str) -> u64 {
        let glob = glob::Pattern::new(pattern).ok();
        let mut removed = 0;
        let Ok(read_dir) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if let Some(logical_key) = logical_key_of(&path) {
                let matches = glob
                    .as_ref()
                    .map(|g| g.matches(&logical_key))
                    .unwrap_or(logical_key == pattern);
                if matches {
                    let _ = std::fs::remove_file(&path);
                    removed += 1;
                }
            }
        }
        removed
    }
}

/// Recovers the logical key from a file's content (filenames are hashes).
fn logical_key_of(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let entry: PersistedEntry = bincode::deserialize(&bytes).ok()?;
    Some(entry.key)
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = PersistentTier::new(dir.path());
        tier.set("k", b"v".to_vec(), Duration::from_secs(60));
        let (value, remaining) = tier.get("k").expect("entry should round-trip");
        assert_eq!(value, b"v".to_vec());
        assert!(remaining <= Duration::from_secs(60));
    }

    #[test]
    fn expired_on_write_when_ttl_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = PersistentTier::new(dir.path());
        tier.set("k", b"v".to_vec(), Duration::from_secs(0));
        assert_eq!(tier.get("k"), None);
    }

    #[test]
    fn missing_file_is_a_silent_miss() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = PersistentTier::new(dir.path());
        assert_eq!(tier.get("nope"), None);
        assert_eq!(tier.io_warnings, 0);
    }
}
