//! In-memory key-value store with file persistence
//!
//! This is the data the cluster replicates. Only the state machine mutates
//! it; ingress reads it directly without going through Raft.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Thread-safe `key -> value` map persisted to a single file.
///
/// Every mutation rewrites the whole file as `key=value` lines. The Raft
/// log is the authoritative copy of the data; the file only speeds up
/// restarts and survives them best-effort.
pub struct KvStore {
    path: PathBuf,
    data: Mutex<BTreeMap<String, String>>,
}

impl KvStore {
    /// Opens the store, loading any existing database file.
    ///
    /// A missing or unreadable file leaves the store empty; committed
    /// entries replayed from the Raft log rebuild the state.
    pub fn open<P: AsRef<Path>>(path: P) -> KvStore {
        let path = path.as_ref().to_path_buf();
        let data = match fs::read_to_string(&path) {
            Ok(contents) => Self::parse(&contents),
            Err(e) => {
                log::warn!("could not load kv file {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };
        KvStore {
            path,
            data: Mutex::new(data),
        }
    }

    fn parse(contents: &str) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for line in contents.lines() {
            // Lines without a separator are skipped, not errors.
            if let Some((key, value)) = line.split_once('=') {
                map.insert(key.to_string(), value.to_string());
            }
        }
        map
    }

    /// Inserts or overwrites a key. Visible to subsequent `get` calls on
    /// this node as soon as this returns.
    pub fn set(&self, key: &str, value: &str) {
        let mut data = self.data.lock().unwrap();
        data.insert(key.to_string(), value.to_string());
        self.persist(&data);
    }

    /// Removes a key. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        let mut data = self.data.lock().unwrap();
        let existed = data.remove(key).is_some();
        if existed {
            self.persist(&data);
        }
        existed
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.lock().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().unwrap().is_empty()
    }

    /// Rewrites the whole file under the store lock. A failed write is
    /// logged and the in-memory mutation stands; the node is not crashed.
    fn persist(&self, data: &BTreeMap<String, String>) {
        let mut out = String::new();
        for (key, value) in data.iter() {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        if let Err(e) = fs::write(&self.path, out) {
            log::error!("failed to persist kv file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_set_get_delete() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path().join("kv.db"));

        assert_eq!(store.get("hello"), None);
        store.set("hello", "world");
        assert_eq!(store.get("hello"), Some("world".to_string()));
        assert!(store.contains("hello"));

        store.set("hello", "again");
        assert_eq!(store.get("hello"), Some("again".to_string()));

        assert!(store.delete("hello"));
        assert!(!store.delete("hello"));
        assert_eq!(store.get("hello"), None);
        assert!(!store.contains("hello"));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kv.db");

        {
            let store = KvStore::open(&path);
            store.set("k1", "v1");
            store.set("k2", "v2");
            store.delete("k1");
        }

        let reopened = KvStore::open(&path);
        assert_eq!(reopened.get("k1"), None);
        assert_eq!(reopened.get("k2"), Some("v2".to_string()));
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_load_skips_malformed_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kv.db");
        std::fs::write(&path, "good=value\nno separator here\nalso=fine\n").unwrap();

        let store = KvStore::open(&path);
        assert_eq!(store.get("good"), Some("value".to_string()));
        assert_eq!(store.get("also"), Some("fine".to_string()));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_missing_file_leaves_store_empty() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path().join("does-not-exist.db"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_value_may_contain_separator() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kv.db");
        {
            let store = KvStore::open(&path);
            store.set("eq", "a=b=c");
        }
        let reopened = KvStore::open(&path);
        assert_eq!(reopened.get("eq"), Some("a=b=c".to_string()));
    }
}
