//! Single-key local store with Put/Commit/Rollback semantics: an
//! in-memory map and a disk-backed variant selected by the
//! `--persistent` flag.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Transaction handle returned by `Store::put`. Never zero: the counter
/// that mints these skips zero so a default-initialised `Txid` can never
/// be mistaken for a real pending write.
pub type Txid = u64;

/// Capability set a local store must expose. Kept narrow deliberately —
/// memory vs. persistent backing is a tagged choice at construction time,
/// not a trait object hierarchy the node needs to reason about.
pub trait Store: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Txid;
    fn commit(&self, key: &[u8], txid: Txid) -> bool;
    fn rollback(&self, txid: Txid);
    fn delete_store(&self);
}

struct Inner {
    committed: HashMap<Vec<u8>, Vec<u8>>,
    pending: HashMap<Txid, (Vec<u8>, Vec<u8>)>,
    next_txid: Txid,
}

impl Inner {
    fn new() -> Self {
        Inner { committed: HashMap::new(), pending: HashMap::new(), next_txid: 0 }
    }

    fn next(&mut self) -> Txid {
        self.next_txid += 1;
        if self.next_txid == 0 {
            self.next_txid += 1;
        }
        self.next_txid
    }
}

/// Entirely in-memory store. Pending writes and committed values both
/// live in the process; nothing survives a restart.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore { inner: Mutex::new(Inner::new()) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().committed.get(key).cloned()
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Txid {
        let mut inner = self.inner.lock().unwrap();
        let txid = inner.next();
        inner.pending.insert(txid, (key.to_vec(), value.to_vec()));
        txid
    }

    fn commit(&self, key: &[u8], txid: Txid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.pending.remove(&txid) {
            Some((pending_key, value)) if pending_key == key => {
                inner.committed.insert(pending_key, value);
                true
            }
            Some(other) => {
                // key mismatch: put it back untouched, report failure.
                inner.pending.insert(txid, other);
                false
            }
            None => false,
        }
    }

    fn rollback(&self, txid: Txid) {
        self.inner.lock().unwrap().pending.remove(&txid);
    }

    fn delete_store(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.committed.clear();
        inner.pending.clear();
    }
}

/// Disk-backed store. Pending writes stay in memory like `MemoryStore`;
/// committed values are appended to a single log file in `dir` and an
/// in-memory index is rebuilt by replaying the log on open, grounded on
/// `datastore/persistent.go`'s intent without its per-key-file layout.
pub struct PersistentStore {
    dir: PathBuf,
    log_path: PathBuf,
    inner: Mutex<Inner>,
}

impl PersistentStore {
    pub fn open(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let log_path = dir.join("transdb.log");

        let mut committed = HashMap::new();
        if log_path.exists() {
            let bytes = fs::read(&log_path)?;
            let mut cursor = 0usize;
            while cursor + 8 <= bytes.len() {
                let key_len = u32::from_be_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
                let val_len = u32::from_be_bytes(bytes[cursor + 4..cursor + 8].try_into().unwrap()) as usize;
                cursor += 8;
                if cursor + key_len + val_len > bytes.len() {
                    break;
                }
                let key = bytes[cursor..cursor + key_len].to_vec();
                cursor += key_len;
                let value = bytes[cursor..cursor + val_len].to_vec();
                cursor += val_len;
                committed.insert(key, value);
            }
        }

        Ok(PersistentStore {
            dir,
            log_path,
            inner: Mutex::new(Inner { committed, pending: HashMap::new(), next_txid: 0 }),
        })
    }

    fn append_record(&self, key: &[u8], value: &[u8]) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&self.log_path)?;
        file.write_all(&(key.len() as u32).to_be_bytes())?;
        file.write_all(&(value.len() as u32).to_be_bytes())?;
        file.write_all(key)?;
        file.write_all(value)?;
        Ok(())
    }
}

impl Store for PersistentStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().committed.get(key).cloned()
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Txid {
        let mut inner = self.inner.lock().unwrap();
        let txid = inner.next();
        inner.pending.insert(txid, (key.to_vec(), value.to_vec()));
        txid
    }

    fn commit(&self, key: &[u8], txid: Txid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.pending.remove(&txid) {
            Some((pending_key, value)) if pending_key == key => {
                if self.append_record(&pending_key, &value).is_err() {
                    return false;
                }
                inner.committed.insert(pending_key, value);
                true
            }
            Some(other) => {
                inner.pending.insert(txid, other);
                false
            }
            None => false,
        }
    }

    fn rollback(&self, txid: Txid) {
        self.inner.lock().unwrap().pending.remove(&txid);
    }

    fn delete_store(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.committed.clear();
        inner.pending.clear();
        let _ = fs::remove_dir_all(&self.dir);
        let _ = fs::create_dir_all(&self.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_is_invisible_until_commit() {
        let store = MemoryStore::new();
        let txid = store.put(b"k", b"v");
        assert_eq!(store.get(b"k"), None);
        assert!(store.commit(b"k", txid));
        assert_eq!(store.get(b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn rollback_discards_pending_write() {
        let store = MemoryStore::new();
        store.put(b"k", b"old");
        store.commit(b"k", 1);
        let txid = store.put(b"k", b"new");
        store.rollback(txid);
        assert_eq!(store.get(b"k"), Some(b"old".to_vec()));
    }

    #[test]
    fn commit_never_issues_txid_zero() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            assert_ne!(store.put(b"k", b"v"), 0);
        }
    }

    #[test]
    fn commit_with_wrong_key_fails() {
        let store = MemoryStore::new();
        let txid = store.put(b"k1", b"v");
        assert!(!store.commit(b"k2", txid));
        assert!(store.commit(b"k1", txid));
    }

    #[test]
    fn delete_store_purges_everything() {
        let store = MemoryStore::new();
        let txid = store.put(b"k", b"v");
        store.commit(b"k", txid);
        store.delete_store();
        assert_eq!(store.get(b"k"), None);
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = PersistentStore::open(dir.path()).unwrap();
            let txid = store.put(b"k", b"v");
            assert!(store.commit(b"k", txid));
        }
        let reopened = PersistentStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get(b"k"), Some(b"v".to_vec()));
    }
}
