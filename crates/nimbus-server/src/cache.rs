//! Shared Cache
//!
//! In-memory mirror of remote resource state, persisted as a JSON snapshot
//! on disk. One mutex guards the whole structure; every accessor copies data
//! in or out, so no caller can touch internal state outside the lock.
//!
//! # Persistence
//!
//! The snapshot lives at a fixed per-user path and is shared between the
//! long-running daemon and short-lived invocations, so all file access goes
//! through `fs2` locks:
//!
//! - `load` takes a shared lock; a missing file yields an empty structure,
//!   not an error.
//! - `flush` only runs when the dirty flag is set. It takes an exclusive
//!   non-blocking lock; if another writer holds it the flush is skipped and
//!   retried on the next dirty cycle, never escalated.
//!
//! The serialized snapshot is captured under the cache lock before any file
//! I/O, so what lands on disk is always a state that existed at a definite
//! instant.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use nimbus_common::{NimbusError, Result};

/// File name of the snapshot inside the cache directory.
const SNAPSHOT_FILE: &str = "info";

/// Cached state for one region. Instance, interface and subnet records are
/// opaque provider documents keyed by their ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionRecord {
    #[serde(default)]
    pub instances: BTreeMap<String, Value>,
    #[serde(default)]
    pub interfaces: BTreeMap<String, Value>,
    #[serde(default)]
    pub subnets: BTreeMap<String, Value>,
    #[serde(default)]
    pub has_running_instances: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,
}

/// The complete cached state: per-region records plus the per-category
/// last-refresh timestamps used by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheData {
    #[serde(default)]
    pub regions: BTreeMap<String, RegionRecord>,
    /// Category name -> last refresh time, in epoch seconds.
    #[serde(default)]
    pub ts_dict: BTreeMap<String, u64>,
}

struct CacheInner {
    data: CacheData,
    dirty: bool,
    /// Bumped on every mutation; lets a flush detect writes that raced it.
    generation: u64,
}

/// Lock-guarded cache shared between the dispatcher and the scheduler.
///
/// Cloning is cheap and shares the same underlying state.
#[derive(Clone)]
pub struct SharedCache {
    inner: Arc<Mutex<CacheInner>>,
    path: PathBuf,
}

impl SharedCache {
    /// Creates an empty cache that persists to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                data: CacheData::default(),
                dirty: false,
                generation: 0,
            })),
            path: path.into(),
        }
    }

    /// Creates a cache at the fixed per-user path (`~/.cache/nimbus/info`).
    pub fn at_default_path() -> Self {
        Self::new(default_cache_dir().join(SNAPSHOT_FILE))
    }

    /// The snapshot path this cache persists to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        // A poisoned lock means a panic inside a critical section; the data
        // is a best-effort mirror, so keep going with whatever is there.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Region mutators. Each holds the lock for its whole critical section
    // and marks the cache dirty on exit.
    // ------------------------------------------------------------------

    /// Replaces the instance map of one region and its running flag.
    pub fn set_region_instances(
        &self,
        region: &str,
        instances: BTreeMap<String, Value>,
        has_running: bool,
    ) {
        let mut inner = self.lock();
        let record = inner.data.regions.entry(region.to_string()).or_default();
        record.instances = instances;
        record.has_running_instances = has_running;
        mark_dirty(&mut inner);
    }

    /// Updates a single instance record. The record must carry an `id`
    /// field identifying it.
    pub fn set_instance(&self, region: &str, instance: Value, is_running: bool) -> Result<()> {
        let id = instance
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                NimbusError::InvalidRequest("instance record has no 'id' field".to_string())
            })?
            .to_string();

        let mut inner = self.lock();
        let record = inner.data.regions.entry(region.to_string()).or_default();
        record.instances.insert(id, instance);
        record.has_running_instances |= is_running;
        mark_dirty(&mut inner);
        Ok(())
    }

    /// Replaces the interface map of one region.
    pub fn set_region_interfaces(&self, region: &str, interfaces: BTreeMap<String, Value>) {
        let mut inner = self.lock();
        let record = inner.data.regions.entry(region.to_string()).or_default();
        record.interfaces = interfaces;
        mark_dirty(&mut inner);
    }

    /// Replaces the subnet map of one region.
    pub fn set_region_subnets(&self, region: &str, subnets: BTreeMap<String, Value>) {
        let mut inner = self.lock();
        let record = inner.data.regions.entry(region.to_string()).or_default();
        record.subnets = subnets;
        mark_dirty(&mut inner);
    }

    /// Sets the human-readable long name (e.g. "Oregon") per region.
    pub fn set_long_names(&self, names: BTreeMap<String, String>) {
        let mut inner = self.lock();
        for (region, name) in names {
            inner.data.regions.entry(region).or_default().long_name = Some(name);
        }
        mark_dirty(&mut inner);
    }

    // ------------------------------------------------------------------
    // Copy-returning readers.
    // ------------------------------------------------------------------

    /// The cached instances of one region; empty map if unknown.
    pub fn instances(&self, region: &str) -> BTreeMap<String, Value> {
        self.lock()
            .data
            .regions
            .get(region)
            .map(|r| r.instances.clone())
            .unwrap_or_default()
    }

    /// The full cached record of one region; empty record if unknown.
    pub fn region(&self, region: &str) -> RegionRecord {
        self.lock()
            .data
            .regions
            .get(region)
            .cloned()
            .unwrap_or_default()
    }

    /// Every cached region record.
    pub fn regions(&self) -> BTreeMap<String, RegionRecord> {
        self.lock().data.regions.clone()
    }

    /// A copy of the complete cached state.
    pub fn data(&self) -> CacheData {
        self.lock().data.clone()
    }

    // ------------------------------------------------------------------
    // Staleness bookkeeping.
    // ------------------------------------------------------------------

    /// Whether `category` is due for a refresh: true when it has never been
    /// refreshed, or `now - last_refresh >= interval`.
    pub fn is_record_old_enough(
        &self,
        now: u64,
        intervals: &BTreeMap<String, u64>,
        category: &str,
    ) -> bool {
        let inner = self.lock();
        let Some(&ts) = inner.data.ts_dict.get(category) else {
            return true;
        };
        let Some(&interval) = intervals.get(category) else {
            return true;
        };
        now.saturating_sub(ts) >= interval
    }

    /// Records that `category` was refreshed at `ts` (epoch seconds).
    pub fn update_record_ts(&self, category: &str, ts: u64) {
        let mut inner = self.lock();
        inner.data.ts_dict.insert(category.to_string(), ts);
        mark_dirty(&mut inner);
    }

    // ------------------------------------------------------------------
    // Persistence.
    // ------------------------------------------------------------------

    /// Populates the cache from the on-disk snapshot.
    ///
    /// A missing file leaves the cache empty and is not an error. Failure to
    /// take the shared file lock reports [`NimbusError::CacheBusy`].
    pub fn load(&self) -> Result<()> {
        if !self.path.is_file() {
            return Ok(());
        }

        let mut file = File::open(&self.path)?;
        fs2::FileExt::lock_shared(&file)
            .map_err(|e| NimbusError::CacheBusy(format!("cannot lock snapshot for read: {}", e)))?;

        let mut contents = String::new();
        let read = file.read_to_string(&mut contents);
        if let Err(e) = fs2::FileExt::unlock(&file) {
            warn!("failed to release shared snapshot lock: {}", e);
        }
        read?;

        let data: CacheData = serde_json::from_str(&contents)?;

        let mut inner = self.lock();
        inner.data = data;
        inner.dirty = false;
        Ok(())
    }

    /// Writes the snapshot to disk if the cache is dirty.
    ///
    /// Returns `Ok(true)` when the on-disk state is current afterwards and
    /// `Ok(false)` when the flush was skipped because another writer holds
    /// the file lock. A skipped flush leaves the dirty flag set, so it is
    /// retried on the next cycle.
    pub fn flush(&self) -> Result<bool> {
        let (snapshot, generation) = {
            let inner = self.lock();
            if !inner.dirty {
                return Ok(true);
            }
            (serde_json::to_string_pretty(&inner.data)?, inner.generation)
        };

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        // A missing file cannot be locked; write it directly.
        if !self.path.is_file() {
            fs::write(&self.path, snapshot.as_bytes())?;
            self.clear_dirty_if_unchanged(generation);
            return Ok(true);
        }

        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        if fs2::FileExt::try_lock_exclusive(&file).is_err() {
            // Concurrent writer; skip this flush and retry on the next one.
            return Ok(false);
        }

        let write = file
            .set_len(0)
            .and_then(|_| file.write_all(snapshot.as_bytes()))
            .and_then(|_| file.flush());
        if let Err(e) = fs2::FileExt::unlock(&file) {
            warn!("failed to release exclusive snapshot lock: {}", e);
        }
        write?;

        self.clear_dirty_if_unchanged(generation);
        Ok(true)
    }

    /// Clears the dirty flag unless a mutation raced the write, in which
    /// case the newer state still needs a flush.
    fn clear_dirty_if_unchanged(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation {
            inner.dirty = false;
        }
    }

    /// Whether in-memory state differs from the last persisted snapshot.
    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }
}

fn mark_dirty(inner: &mut CacheInner) {
    inner.dirty = true;
    inner.generation = inner.generation.wrapping_add(1);
}

/// The per-user cache directory (`~/.cache/nimbus`).
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nimbus")
}
