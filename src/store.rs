//! Persistent area-description store.
//!
//! One directory per record under the store root:
//!
//! ```text
//! <root>/<uuid>/map.bin        opaque map payload
//! <root>/<uuid>/metadata.json  string key/value pairs
//! ```
//!
//! New records are assembled in a `.staging-<uuid>` directory and renamed
//! into place; deletes rename to `.trash-<uuid>` before removal. A record
//! is therefore either fully present or absent.

use crate::archive;
use crate::error::{ArchiveError, DeleteError, PersistenceError, StoreError};
use crate::types::{AdfRecord, AdfSummary};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const KEY_NAME: &str = "name";
pub const KEY_DATE: &str = "date_ms_since_epoch";

const PAYLOAD_FILE: &str = "map.bin";
const METADATA_FILE: &str = "metadata.json";
const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

pub struct AdfStore {
    root: PathBuf,
    /// Per-record locks; persist, metadata writes and delete of one uuid are serialized.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AdfStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Leftovers from interrupted writes or deletes are cleaned up.
    pub fn open(root: impl Into<PathBuf>) -> Result<AdfStore, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;

        let entries = fs::read_dir(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(STAGING_PREFIX) || name.starts_with(TRASH_PREFIX) {
                log::warn!("Removing incomplete store entry {}", name);
                if let Err(e) = fs::remove_dir_all(entry.path()) {
                    log::warn!("Failed to remove {}: {}", name, e);
                }
            }
        }

        log::info!("Opened area description store at {}", root.display());
        Ok(AdfStore {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Summaries of all records, sorted by uuid.
    pub fn list_all(&self) -> Vec<AdfSummary> {
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("Failed to list {}: {}", self.root.display(), e);
                return Vec::new();
            }
        };

        let mut uuids: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| is_valid_uuid(name))
            .collect();
        uuids.sort();

        uuids
            .into_iter()
            .map(|uuid| AdfSummary {
                name: self.get_metadata(&uuid, KEY_NAME),
                uuid,
            })
            .collect()
    }

    pub fn contains(&self, uuid: &str) -> bool {
        is_valid_uuid(uuid) && self.record_dir(uuid).is_dir()
    }

    /// The most recently saved record, by its save date.
    pub fn latest(&self) -> Option<String> {
        self.list_all()
            .into_iter()
            .map(|s| {
                let date = self
                    .get_metadata(&s.uuid, KEY_DATE)
                    .and_then(|d| d.parse::<u64>().ok())
                    .unwrap_or(0);
                (date, s.uuid)
            })
            .max()
            .map(|(_, uuid)| uuid)
    }

    /// One metadata value; `None` if the record or key is absent.
    pub fn get_metadata(&self, uuid: &str, key: &str) -> Option<String> {
        match self.metadata(uuid) {
            Ok(mut map) => map.remove(key),
            Err(StoreError::NotFound(_)) | Err(StoreError::InvalidUuid(_)) => None,
            Err(e) => {
                log::warn!("Failed to read metadata of {}: {}", uuid, e);
                None
            }
        }
    }

    /// The whole metadata map of a record.
    pub fn metadata(&self, uuid: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let dir = self.existing_record_dir(uuid)?;
        read_metadata(uuid, &dir)
    }

    pub fn set_metadata(&self, uuid: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.existing_record_dir(uuid)?;
        let lock = self.record_lock(uuid);
        let _guard = lock.lock();

        // Re-check under the lock: a concurrent delete may have won.
        let dir = self.existing_record_dir(uuid)?;
        let mut metadata = read_metadata(uuid, &dir)?;
        metadata.insert(key.to_string(), value.to_string());
        write_metadata_atomic(&dir, &metadata).map_err(|source| StoreError::Io {
            path: dir.join(METADATA_FILE),
            source,
        })?;
        log::debug!("Set metadata {}[{}]", uuid, key);
        Ok(())
    }

    /// Full record including payload.
    pub fn load(&self, uuid: &str) -> Result<AdfRecord, StoreError> {
        let dir = self.existing_record_dir(uuid)?;
        let metadata = read_metadata(uuid, &dir)?;
        let payload_path = dir.join(PAYLOAD_FILE);
        let payload = fs::read(&payload_path).map_err(|source| StoreError::Io {
            path: payload_path,
            source,
        })?;
        Ok(AdfRecord {
            uuid: uuid.to_string(),
            metadata,
            payload,
        })
    }

    pub fn delete(&self, uuid: &str) -> Result<(), DeleteError> {
        self.existing_record_dir(uuid)?;
        let lock = self.record_lock(uuid);
        let _guard = lock.lock();

        let dir = self.existing_record_dir(uuid)?;
        let trash = self.root.join(format!("{}{}", TRASH_PREFIX, uuid));
        fs::rename(&dir, &trash).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        if let Err(e) = fs::remove_dir_all(&trash) {
            // The record is already gone from the listing; `open` sweeps the rest.
            log::warn!("Failed to remove {}: {}", trash.display(), e);
        }
        self.locks.lock().remove(uuid);
        log::info!("Deleted area description {}", uuid);
        Ok(())
    }

    /// Write a new record under a fresh uuid with an empty metadata map.
    ///
    /// # Panics
    /// If the freshly generated uuid already exists in the store.
    pub fn persist(&self, payload: &[u8]) -> Result<AdfRecord, PersistenceError> {
        let uuid = uuid::Uuid::new_v4().to_string();
        match self.try_create(&uuid, &BTreeMap::new(), payload)? {
            Some(record) => Ok(record),
            None => panic!("uuid collision on freshly generated area description {}", uuid),
        }
    }

    /// Write a self-contained archive of `uuid` into `dest_dir`.
    pub fn export(&self, uuid: &str, dest_dir: &Path) -> Result<PathBuf, ArchiveError> {
        let record = self.load(uuid)?;
        let path = archive::write_file(&record, dest_dir)?;
        log::info!("Exported {} to {}", uuid, path.display());
        Ok(path)
    }

    /// Import an archive; keeps its uuid when free, otherwise assigns a new one.
    pub fn import(&self, path: &Path) -> Result<AdfRecord, ArchiveError> {
        let record = archive::read_file(path)?;
        let mut uuid = if is_valid_uuid(&record.uuid) {
            record.uuid.clone()
        } else {
            uuid::Uuid::new_v4().to_string()
        };
        loop {
            if let Some(stored) = self.try_create(&uuid, &record.metadata, &record.payload)? {
                if stored.uuid != record.uuid {
                    log::info!("Imported {} as {}", record.uuid, stored.uuid);
                } else {
                    log::info!("Imported {}", stored.uuid);
                }
                return Ok(stored);
            }
            uuid = uuid::Uuid::new_v4().to_string();
        }
    }

    /// Create a record unless `uuid` is taken (`Ok(None)`).
    fn try_create(
        &self,
        uuid: &str,
        metadata: &BTreeMap<String, String>,
        payload: &[u8],
    ) -> Result<Option<AdfRecord>, PersistenceError> {
        let lock = self.record_lock(uuid);
        let _guard = lock.lock();

        let final_dir = self.record_dir(uuid);
        if final_dir.exists() {
            return Ok(None);
        }

        let staging = self.root.join(format!("{}{}", STAGING_PREFIX, uuid));
        let result = write_record(&staging, metadata, payload)
            .and_then(|_| fs::rename(&staging, &final_dir).map_err(|e| (staging.clone(), e)));
        if let Err((path, source)) = result {
            if staging.exists() {
                let _ = fs::remove_dir_all(&staging);
            }
            return Err(PersistenceError::Io { path, source });
        }

        log::info!("Persisted area description {} ({} bytes)", uuid, payload.len());
        Ok(Some(AdfRecord {
            uuid: uuid.to_string(),
            metadata: metadata.clone(),
            payload: payload.to_vec(),
        }))
    }

    fn record_dir(&self, uuid: &str) -> PathBuf {
        self.root.join(uuid)
    }

    fn existing_record_dir(&self, uuid: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_uuid(uuid) {
            return Err(StoreError::InvalidUuid(uuid.to_string()));
        }
        let dir = self.record_dir(uuid);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(StoreError::NotFound(uuid.to_string()))
        }
    }

    fn record_lock(&self, uuid: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(uuid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Canonical hyphenated uuid; rejects anything that could escape the root.
fn is_valid_uuid(s: &str) -> bool {
    uuid::Uuid::parse_str(s).is_ok_and(|u| u.hyphenated().to_string() == s)
}

fn read_metadata(uuid: &str, dir: &Path) -> Result<BTreeMap<String, String>, StoreError> {
    let path = dir.join(METADATA_FILE);
    let bytes = fs::read(&path).map_err(|source| StoreError::Io { path, source })?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::CorruptMetadata {
        uuid: uuid.to_string(),
        reason: e.to_string(),
    })
}

fn write_metadata_atomic(dir: &Path, metadata: &BTreeMap<String, String>) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(metadata).map_err(std::io::Error::other)?;
    let tmp = dir.join(format!("{}.tmp", METADATA_FILE));
    write_synced(&tmp, &json)?;
    fs::rename(&tmp, dir.join(METADATA_FILE))
}

fn write_record(
    staging: &Path,
    metadata: &BTreeMap<String, String>,
    payload: &[u8],
) -> Result<(), (PathBuf, std::io::Error)> {
    fs::create_dir(staging).map_err(|e| (staging.to_path_buf(), e))?;
    let payload_path = staging.join(PAYLOAD_FILE);
    write_synced(&payload_path, payload).map_err(|e| (payload_path, e))?;
    let json = serde_json::to_vec_pretty(metadata)
        .map_err(|e| (staging.join(METADATA_FILE), std::io::Error::other(e)))?;
    let meta_path = staging.join(METADATA_FILE);
    write_synced(&meta_path, &json).map_err(|e| (meta_path, e))?;
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, AdfStore) {
        let temp = TempDir::new().unwrap();
        let store = AdfStore::open(temp.path().join("adf")).unwrap();
        (temp, store)
    }

    #[test]
    fn test_persist_then_set_and_get_name() {
        let (_temp, store) = store();
        let record = store.persist(b"payload").unwrap();
        assert!(record.metadata.is_empty());
        assert_eq!(store.get_metadata(&record.uuid, KEY_NAME), None);

        store.set_metadata(&record.uuid, KEY_NAME, "X").unwrap();
        assert_eq!(store.get_metadata(&record.uuid, KEY_NAME).as_deref(), Some("X"));

        let loaded = store.load(&record.uuid).unwrap();
        assert_eq!(loaded.payload, b"payload");
        assert_eq!(loaded.name(), Some("X"));
    }

    #[test]
    fn test_set_metadata_on_missing_record() {
        let (_temp, store) = store();
        let missing = uuid::Uuid::new_v4().to_string();
        assert!(matches!(
            store.set_metadata(&missing, KEY_NAME, "x"),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.set_metadata("../escape", KEY_NAME, "x"),
            Err(StoreError::InvalidUuid(_))
        ));
    }

    #[test]
    fn test_delete_removes_and_second_delete_is_not_found() {
        let (_temp, store) = store();
        let a = store.persist(b"a").unwrap();
        let b = store.persist(b"b").unwrap();

        store.delete(&a.uuid).unwrap();
        let listed: Vec<String> = store.list_all().into_iter().map(|s| s.uuid).collect();
        assert_eq!(listed, vec![b.uuid.clone()]);
        assert!(matches!(store.delete(&a.uuid), Err(StoreError::NotFound(_))));
        assert_eq!(store.get_metadata(&a.uuid, KEY_NAME), None);
    }

    #[test]
    fn test_list_is_sorted_and_stable() {
        let (_temp, store) = store();
        for i in 0..5u8 {
            let r = store.persist(&[i]).unwrap();
            store.set_metadata(&r.uuid, KEY_NAME, &format!("room {}", i)).unwrap();
        }
        let first = store.list_all();
        assert_eq!(first.len(), 5);
        assert!(first.windows(2).all(|w| w[0].uuid < w[1].uuid));
        assert_eq!(first, store.list_all());
        assert!(first.iter().all(|s| s.name.as_deref().unwrap_or("").starts_with("room")));
    }

    #[test]
    fn test_uuids_are_unique() {
        let (_temp, store) = store();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            assert!(seen.insert(store.persist(b"x").unwrap().uuid));
        }
    }

    #[test]
    fn test_open_sweeps_interrupted_writes() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("adf");
        let store = AdfStore::open(&root).unwrap();
        let kept = store.persist(b"kept").unwrap();
        fs::create_dir(root.join(format!("{}{}", STAGING_PREFIX, uuid::Uuid::new_v4()))).unwrap();
        fs::create_dir(root.join(format!("{}{}", TRASH_PREFIX, uuid::Uuid::new_v4()))).unwrap();
        drop(store);

        let store = AdfStore::open(&root).unwrap();
        let names: Vec<_> = fs::read_dir(&root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![kept.uuid.clone()]);
        assert_eq!(store.list_all().len(), 1);
    }

    #[test]
    fn test_failed_persist_leaves_store_unchanged() {
        let (_temp, store) = store();
        let before = store.persist(b"before").unwrap();
        store.set_metadata(&before.uuid, KEY_NAME, "Lab").unwrap();

        // A plain file where the staging directory would go.
        let uuid = uuid::Uuid::new_v4().to_string();
        let blocker = store.root().join(format!("{}{}", STAGING_PREFIX, uuid));
        fs::write(&blocker, b"not a directory").unwrap();

        let result = store.try_create(&uuid, &BTreeMap::new(), b"after");
        assert!(matches!(result, Err(PersistenceError::Io { .. })));

        let listed: Vec<_> = store.list_all().into_iter().map(|s| s.uuid).collect();
        assert_eq!(listed, vec![before.uuid.clone()]);
        assert!(!store.contains(&uuid));
        assert_eq!(store.get_metadata(&before.uuid, KEY_NAME).as_deref(), Some("Lab"));
        assert_eq!(store.load(&before.uuid).unwrap().payload, b"before");
    }

    #[test]
    fn test_failed_delete_keeps_record() {
        let (_temp, store) = store();
        let record = store.persist(b"keep me").unwrap();
        store.set_metadata(&record.uuid, KEY_NAME, "Hall").unwrap();

        // A non-empty directory in the way of the trash rename.
        let trash = store.root().join(format!("{}{}", TRASH_PREFIX, record.uuid));
        fs::create_dir(&trash).unwrap();
        fs::write(trash.join("leftover"), b"x").unwrap();

        assert!(matches!(store.delete(&record.uuid), Err(StoreError::Io { .. })));

        let listed = store.list_all();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].uuid, record.uuid);
        assert_eq!(listed[0].name.as_deref(), Some("Hall"));
        assert_eq!(store.load(&record.uuid).unwrap().payload, b"keep me");
    }

    #[test]
    fn test_latest_uses_save_date() {
        let (_temp, store) = store();
        let old = store.persist(b"old").unwrap();
        let new = store.persist(b"new").unwrap();
        store.set_metadata(&old.uuid, KEY_DATE, "1000").unwrap();
        store.set_metadata(&new.uuid, KEY_DATE, "2000").unwrap();
        assert_eq!(store.latest(), Some(new.uuid));
    }

    #[test]
    fn test_concurrent_metadata_writers() {
        let (_temp, store) = store();
        let store = Arc::new(store);
        let record = store.persist(b"p").unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let uuid = record.uuid.clone();
                std::thread::spawn(move || {
                    store.set_metadata(&uuid, &format!("k{}", i), "v").unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.metadata(&record.uuid).unwrap().len(), 8);
    }
}
