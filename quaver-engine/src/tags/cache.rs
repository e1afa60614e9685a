//! Persistent tag cache
//!
//! Maps canonical file paths to cached [`TagRecord`] snapshots so large
//! libraries browse without re-reading every file. The store directory
//! holds a small version tag file next to the main store file; on any
//! version mismatch both are deleted together and the cache rebuilds empty
//! — full invalidation, not a migration. Losing the cache is cheap, the
//! source files remain authoritative.
//!
//! Durability is periodic: every Nth write forces a sync, so an unclean
//! shutdown loses at most N-1 pending writes.

use crate::tags::store::{KeyGuard, SqliteStore, Store};
use crate::tags::{file_mtime, TagRecord};
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

/// Bump when the record layout changes; invalidates every existing cache
const CACHE_FORMAT_VERSION: u32 = 1;

const VERSION_TAG_FILE: &str = "version_tag";
const STORE_FILE: &str = "tags.db";

/// Store side files deleted together with the store on invalidation
const STORE_SIDE_FILES: [&str; 2] = ["tags.db-wal", "tags.db-shm"];

/// Version tag covering both the record format and the storage engine
fn expected_version_tag() -> String {
    format!("{} sqlite {}", CACHE_FORMAT_VERSION, rusqlite::version())
}

/// Persistent path -> tag snapshot cache with per-key locking
pub struct TagCache {
    store: Box<dyn Store>,
    dir: PathBuf,
    writes: AtomicU32,
    sync_interval: u32,
}

impl TagCache {
    /// Open (or create) the cache rooted at `dir`.
    ///
    /// A failure here is fatal to the process — running without the tag
    /// cache is not a supported degraded mode; the caller escalates.
    pub fn open(dir: &Path, sync_interval: u32) -> Result<TagCache> {
        fs::create_dir_all(dir)?;

        let tag_path = dir.join(VERSION_TAG_FILE);
        let store_path = dir.join(STORE_FILE);
        let expected = expected_version_tag();

        let on_disk = fs::read_to_string(&tag_path).ok();
        if on_disk.as_deref().map(str::trim) != Some(expected.as_str()) {
            if store_path.exists() || tag_path.exists() {
                info!(
                    "Tag cache version mismatch (found {:?}, want {:?}), rebuilding empty",
                    on_disk.as_deref().map(str::trim),
                    expected
                );
            }
            // The version tag and the store are one unit: delete together
            for name in STORE_SIDE_FILES {
                let _ = fs::remove_file(dir.join(name));
            }
            if store_path.exists() {
                fs::remove_file(&store_path)?;
            }
            if tag_path.exists() {
                fs::remove_file(&tag_path)?;
            }
        }

        let store = SqliteStore::open(&store_path)?;
        fs::write(&tag_path, &expected)?;
        debug!("Tag cache ready at {}", dir.display());

        Ok(TagCache {
            store: Box::new(store),
            dir: dir.to_path_buf(),
            writes: AtomicU32::new(0),
            sync_interval: sync_interval.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The canonical cache key for a file path
    pub fn key_for(path: &Path) -> String {
        fs::canonicalize(path)
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .into_owned()
    }

    /// Fetch a record. A missing key is `None`; a record that fails to
    /// deserialize degrades to `None` too (the tags get re-read from the
    /// file). Store-level failures are returned for the caller to degrade.
    pub fn get(&self, key: &str) -> Result<Option<TagRecord>> {
        let Some(data) = self.store.get(key)? else {
            return Ok(None);
        };
        match TagRecord::deserialize(&data) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Corrupt tag record for {} ({}), treating as miss", key, e);
                Ok(None)
            }
        }
    }

    /// Upsert a record. Every `sync_interval`-th write forces a durability
    /// sync; in between, writes may sit in volatile buffers.
    pub fn add(&self, key: &str, record: &TagRecord) -> Result<()> {
        self.store.put(key, &record.serialize())?;
        let n = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.sync_interval == 0 {
            self.store.sync()?;
        }
        Ok(())
    }

    /// Delete a record, tolerating "not found"
    pub fn remove(&self, key: &str) -> Result<()> {
        self.store.delete(key)
    }

    /// Exclusive per-key advisory lock, released when the guard drops.
    /// Used to serialize concurrent tag reads/writes for one file across
    /// threads (library scan vs playback-tag refresh). Not reentrant.
    pub fn lock(&self, key: &str) -> KeyGuard {
        self.store.lock(key)
    }

    /// Modification-time-validated lookup: returns the cached record only
    /// while its stored mtime matches the file's current mtime.
    pub fn lookup(&self, path: &Path) -> Result<Option<TagRecord>> {
        let key = Self::key_for(path);
        let mtime = file_mtime(path)?;
        match self.get(&key)? {
            Some(record) if record.mtime == mtime => Ok(Some(record)),
            _ => Ok(None),
        }
    }
}
