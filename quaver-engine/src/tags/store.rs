//! Key/value storage engines for the tag cache
//!
//! [`Store`] is the small interface the cache needs: get, put, delete,
//! sync, and a per-key advisory lock. The production engine is
//! [`SqliteStore`]; [`MemoryStore`] serves tests and small deployments.
//! Either way the engine serializes its own page-level access internally —
//! the per-key locks exist for callers coordinating logical operations
//! (read-check-write of one file's tags) across threads.

use crate::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, trace};

/// Key/value store with per-key advisory locking
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Delete an entry, tolerating "not found"
    fn delete(&self, key: &str) -> Result<()>;
    /// Force pending writes to durable storage
    fn sync(&self) -> Result<()>;
    /// Acquire the exclusive advisory lock for `key`, blocking until free.
    /// Released when the guard drops. Not reentrant: locking a key twice
    /// from one thread deadlocks.
    fn lock(&self, key: &str) -> KeyGuard;
}

// ========================================
// Per-key locks
// ========================================

#[derive(Default)]
struct LockState {
    locked: bool,
    waiters: u32,
}

#[derive(Default)]
struct LockEntry {
    state: Mutex<LockState>,
    cv: Condvar,
}

/// Table of independent per-key locks; entries are created on demand and
/// removed once no holder or waiter remains
#[derive(Default)]
pub struct KeyLocks {
    entries: Mutex<HashMap<String, Arc<LockEntry>>>,
}

impl KeyLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acquire(self: &Arc<Self>, key: &str) -> KeyGuard {
        let entry = {
            let mut entries = self.entries.lock().unwrap();
            Arc::clone(
                entries
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(LockEntry::default())),
            )
        };

        {
            let mut state = entry.state.lock().unwrap();
            state.waiters += 1;
            while state.locked {
                state = entry.cv.wait(state).unwrap();
            }
            state.waiters -= 1;
            state.locked = true;
        }
        trace!("Locked key {}", key);

        KeyGuard {
            key: key.to_string(),
            entry,
            locks: Arc::clone(self),
        }
    }

    fn release(&self, key: &str, entry: &Arc<LockEntry>) {
        let idle = {
            let mut state = entry.state.lock().unwrap();
            state.locked = false;
            state.waiters == 0
        };
        entry.cv.notify_one();
        trace!("Unlocked key {}", key);

        if idle {
            // Re-check under the table lock: a waiter may have arrived
            let mut entries = self.entries.lock().unwrap();
            if let Some(current) = entries.get(key) {
                if Arc::ptr_eq(current, entry) {
                    let state = current.state.lock().unwrap();
                    if !state.locked && state.waiters == 0 {
                        drop(state);
                        entries.remove(key);
                    }
                }
            }
        }
    }
}

/// RAII guard for one key's advisory lock
pub struct KeyGuard {
    key: String,
    entry: Arc<LockEntry>,
    locks: Arc<KeyLocks>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.locks.release(&self.key, &self.entry);
    }
}

// ========================================
// SQLite engine
// ========================================

/// Persistent store on bundled SQLite.
///
/// Durability is deliberately relaxed (`synchronous=OFF` under WAL) so an
/// `add` does not fsync; [`Store::sync`] checkpoints the WAL explicitly
/// and the cache calls it every N writes.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    locks: Arc<KeyLocks>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "OFF")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tags (
                path TEXT PRIMARY KEY,
                data BLOB NOT NULL
            )",
            [],
        )?;
        debug!("Opened tag store at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            locks: KeyLocks::new(),
        })
    }
}

impl Store for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let data = conn
            .query_row(
                "SELECT data FROM tags WHERE path = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(data)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO tags (path, data) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM tags WHERE path = ?1", params![key])?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        trace!("Tag store checkpointed");
        Ok(())
    }

    fn lock(&self, key: &str) -> KeyGuard {
        self.locks.acquire(key)
    }
}

// ========================================
// In-process engine
// ========================================

/// Map-backed store for tests and deployments that do not need
/// persistence; sync is a no-op
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, Vec<u8>>>,
    locks: Arc<KeyLocks>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.map.lock().unwrap().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn lock(&self, key: &str) -> KeyGuard {
        self.locks.acquire(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_memory_store_crud() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").unwrap(), None);
        store.put("a", b"one").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"one".to_vec()));
        store.put("a", b"two").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"two".to_vec()));
        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        // Deleting a missing key is fine
        store.delete("a").unwrap();
    }

    #[test]
    fn test_sqlite_store_crud() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("tags.db")).unwrap();
        store.put("x", b"payload").unwrap();
        assert_eq!(store.get("x").unwrap(), Some(b"payload".to_vec()));
        store.sync().unwrap();
        store.delete("x").unwrap();
        assert_eq!(store.get("x").unwrap(), None);
    }

    #[test]
    fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put("k", b"v").unwrap();
            store.sync().unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_key_lock_excludes_same_key() {
        let locks = KeyLocks::new();
        let guard = locks.acquire("song.flac");

        let (tx, rx) = mpsc::channel();
        let locks2 = Arc::clone(&locks);
        let handle = thread::spawn(move || {
            let _g = locks2.acquire("song.flac");
            tx.send(()).unwrap();
        });

        // The second acquire must block while we hold the lock
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(guard);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_key_locks_are_independent() {
        let locks = KeyLocks::new();
        let _a = locks.acquire("a");
        // A different key does not block
        let _b = locks.acquire("b");
    }

    #[test]
    fn test_lock_table_cleans_up() {
        let locks = KeyLocks::new();
        drop(locks.acquire("transient"));
        assert!(locks.entries.lock().unwrap().is_empty());
    }

    #[test]
    fn test_lock_contention_serializes() {
        let locks = KeyLocks::new();
        let counter = Arc::new(Mutex::new(0u32));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let _g = locks.acquire("shared");
                    let mut c = counter.lock().unwrap();
                    *c += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 400);
    }
}
