//! Local file store - the synchronous fallback backend.
//!
//! A single JSON file holds a name -> record map. The map is loaded lazily
//! into memory on first access and rewritten synchronously on every
//! mutation. Durability is best-effort: a malformed or unreadable file is
//! treated as an empty store, and write failures are logged and dropped.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::backend::{Backend, StoredRecord};

/// Synchronous file-backed implementation of [`Backend`].
///
/// All cells sharing a resolver share one file; records are keyed by cell
/// name. Suitable as a fallback when the durable backend is unavailable.
pub struct LocalStore {
    path: PathBuf,
    entries: Mutex<Option<HashMap<String, StoredRecord>>>,
}

impl LocalStore {
    /// Create a store backed by the given file. The file is not touched
    /// until the first read or write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(None),
        }
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a record synchronously.
    pub fn read_sync(&self, name: &str) -> Option<StoredRecord> {
        let mut entries = self.entries.lock();
        self.loaded(&mut entries).get(name).cloned()
    }

    /// Write a record synchronously.
    pub fn write_sync(&self, name: &str, record: StoredRecord) {
        let mut entries = self.entries.lock();
        let map = self.loaded(&mut entries);
        map.insert(name.to_string(), record);
        self.persist(map);
    }

    /// Delete a record synchronously, if present.
    pub fn delete_sync(&self, name: &str) {
        let mut entries = self.entries.lock();
        let map = self.loaded(&mut entries);
        if map.remove(name).is_some() {
            self.persist(map);
        }
    }

    fn loaded<'a>(
        &self,
        entries: &'a mut Option<HashMap<String, StoredRecord>>,
    ) -> &'a mut HashMap<String, StoredRecord> {
        entries.get_or_insert_with(|| match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(path = %self.path.display(), %err, "malformed local store file, starting empty");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        })
    }

    fn persist(&self, map: &HashMap<String, StoredRecord>) {
        let write = || -> crate::error::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&self.path, serde_json::to_vec(map)?)?;
            Ok(())
        };
        if let Err(err) = write() {
            warn!(path = %self.path.display(), %err, "dropping local store write");
        } else {
            debug!(path = %self.path.display(), "local store written");
        }
    }
}

#[async_trait]
impl Backend for LocalStore {
    async fn read(&self, name: &str) -> Option<StoredRecord> {
        self.read_sync(name)
    }

    async fn write(&self, name: &str, record: StoredRecord) {
        self.write_sync(name, record);
    }

    async fn delete(&self, name: &str) {
        self.delete_sync(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> StoredRecord {
        StoredRecord {
            value,
            previous_value: None,
        }
    }

    #[test]
    fn test_read_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("local.json"));
        assert!(store.read_sync("tags").is_none());
    }

    #[test]
    fn test_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("local.json"));

        store.write_sync("tags", record(json!(["a", "b"])));
        let loaded = store.read_sync("tags").unwrap();
        assert_eq!(loaded.value, json!(["a", "b"]));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.json");

        LocalStore::new(&path).write_sync("counter", record(json!(5)));

        let reopened = LocalStore::new(&path);
        assert_eq!(reopened.read_sync("counter").unwrap().value, json!(5));
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("local.json"));

        store.write_sync("tags", record(json!([])));
        store.delete_sync("tags");
        assert!(store.read_sync("tags").is_none());

        // Deleting again is a no-op.
        store.delete_sync("tags");
    }

    #[test]
    fn test_malformed_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.json");
        fs::write(&path, b"{ not json").unwrap();

        let store = LocalStore::new(&path);
        assert!(store.read_sync("tags").is_none());

        // Writing replaces the malformed file.
        store.write_sync("tags", record(json!(1)));
        assert_eq!(store.read_sync("tags").unwrap().value, json!(1));
    }

    #[test]
    fn test_records_are_independent_per_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("local.json"));

        store.write_sync("a", record(json!(1)));
        store.write_sync("b", record(json!(2)));
        store.delete_sync("a");

        assert!(store.read_sync("a").is_none());
        assert_eq!(store.read_sync("b").unwrap().value, json!(2));
    }

    #[tokio::test]
    async fn test_backend_trait_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("local.json"));

        Backend::write(&store, "tags", record(json!(["x"]))).await;
        let loaded = Backend::read(&store, "tags").await.unwrap();
        assert_eq!(loaded.value, json!(["x"]));
        Backend::delete(&store, "tags").await;
        assert!(Backend::read(&store, "tags").await.is_none());
    }
}
