//! The cache container: index of entries over one store.

use std::cell::{Ref, RefCell};
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

use shelf_store::{BlobStore, LabeledStore, Labels, ObjectId, SandboxConfig};
use tracing::{debug, info, instrument, warn};

use crate::entry::CacheEntry;
use crate::{CacheError, Result};

/// Outcome of rebuilding the index from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RescanStats {
    /// Objects indexed.
    pub loaded: usize,
    /// Objects that could not be mapped and were left out.
    pub skipped: usize,
}

/// Outcome of a pending-deletion sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Entries dropped from the index.
    pub deleted: usize,
    /// Objects whose files could not be removed from the store.
    pub failed: Vec<ObjectId>,
}

/// A label-indexed cache of stored objects.
///
/// The cache holds one reference to every entry it lists. Lookups hand out
/// borrows and never change refcounts; clone an entry to keep it.
pub struct Cache<S: BlobStore> {
    store: Rc<RefCell<S>>,
    entries: Vec<CacheEntry<S>>,
}

impl Cache<LabeledStore> {
    /// Open the store directory at `dir` and index everything in it.
    pub fn open<P: AsRef<Path>>(dir: P, max_entries: u32) -> Result<Self> {
        let store = LabeledStore::open(dir, max_entries)?;
        Self::with_store(store)
    }
}

impl<S: BlobStore> Cache<S> {
    /// Build a cache over an already opened store.
    pub fn with_store(store: S) -> Result<Self> {
        let mut cache = Self {
            store: Rc::new(RefCell::new(store)),
            entries: Vec::new(),
        };
        let stats = cache.rescan()?;
        info!(
            loaded = stats.loaded,
            skipped = stats.skipped,
            "Opened cache"
        );
        Ok(cache)
    }

    /// Write `body` to the store and index it.
    ///
    /// Returns the caller's reference; the cache keeps a second one. Nothing
    /// is indexed if the write fails. Labels should have distinct keys; if
    /// they do not, all pairs are stored and lookups see the first one.
    #[instrument(skip(self, labels, body), fields(body_len = body.len()), level = "debug")]
    pub fn add(&mut self, labels: Labels, body: &[u8]) -> Result<CacheEntry<S>> {
        let object = self.store.borrow_mut().save_labeled(&labels, body)?;
        let entry = CacheEntry::new(object, labels, &self.store);
        self.register(entry.clone());
        Ok(entry)
    }

    /// Some live entry labeled `key` = `value`.
    pub fn find_first(&self, key: &str, value: &str) -> Option<&CacheEntry<S>> {
        self.entries
            .iter()
            .find(|entry| is_live_match(entry, Some(key), value))
    }

    /// Append every live entry labeled `key` = `value` to `out`. With no
    /// `key`, every live entry matches.
    pub fn find_all<'a>(
        &'a self,
        key: Option<&str>,
        value: &str,
        out: &mut Vec<&'a CacheEntry<S>>,
    ) {
        out.extend(
            self.entries
                .iter()
                .filter(|entry| is_live_match(entry, key, value)),
        );
    }

    /// Unmap every cache-only entry that has been idle since `cutoff` or
    /// earlier. Returns how many were unmapped.
    pub fn unmap_lazy(&mut self, cutoff: Instant) -> usize {
        let mut unmapped = 0;
        for entry in &self.entries {
            debug_assert!(entry.is_attached(), "indexed entry is detached");
            if entry.refcount() > 1 {
                continue;
            }
            if !entry.idle_since().is_idle_at(cutoff) {
                continue;
            }
            if !entry.is_mapped() {
                continue;
            }
            if entry.unmap() {
                unmapped += 1;
            }
        }
        debug!(unmapped, "Lazy unmap sweep finished");
        unmapped
    }

    /// Delete every entry marked for removal.
    ///
    /// Unless `force` is set, entries someone else still holds are kept for
    /// a later sweep. Forced deletion detaches held entries: their holders
    /// keep whatever is mapped but can never map them again.
    pub fn delete_pending(&mut self, force: bool) -> SweepReport {
        let (doomed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| {
                debug_assert!(entry.is_attached(), "indexed entry is detached");
                entry.is_pending_removal() && (force || entry.refcount() <= 1)
            });
        self.entries = kept;

        let mut report = SweepReport::default();
        for entry in doomed {
            let object = entry.object_id().clone();
            entry.detach();
            drop(entry);
            report.deleted += 1;

            match self.store.borrow_mut().remove(&object) {
                Ok(()) => debug!("Deleted object {}", object),
                Err(e) => {
                    warn!("Unable to delete object {} from cache: {}", object, e);
                    report.failed.push(object);
                }
            }
        }
        report
    }

    /// Rebuild the index from the store.
    ///
    /// Entries currently listed are released first (pending ones that nobody
    /// holds are deleted). Objects that fail to map are logged and skipped.
    pub fn rescan(&mut self) -> Result<RescanStats> {
        self.clear();

        let objects = self.store.borrow().list()?;
        let mut stats = RescanStats::default();
        for object in objects {
            let mapped = self.store.borrow().map_labeled(&object);
            match mapped {
                Ok((labels, mapping)) => {
                    // Only the labels are needed now; the body maps on demand.
                    drop(mapping);
                    // Fresh entries from a cleared index cannot collide.
                    self.entries
                        .push(CacheEntry::new(object, labels, &self.store));
                    stats.loaded += 1;
                }
                Err(e) => {
                    warn!("Unable to map object {} from cache: {}", object, e);
                    stats.skipped += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Release every entry and close the store. Entries still held elsewhere
    /// survive detached.
    pub fn close(self) {
        drop(self);
    }

    /// Let the store record the paths it needs in `cfg`.
    pub fn register_with_sandbox(&self, cfg: &mut SandboxConfig) {
        self.store.borrow().register_with_sandbox(cfg);
    }

    /// Every indexed entry, including those pending removal.
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry<S>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn store(&self) -> Ref<'_, S> {
        self.store.borrow()
    }

    #[cfg(test)]
    pub(crate) fn store_mut(&self) -> std::cell::RefMut<'_, S> {
        self.store.borrow_mut()
    }

    /// Index an entry added after the initial scan.
    fn register(&mut self, entry: CacheEntry<S>) {
        debug_assert!(
            !self.entries.iter().any(|e| e.ptr_eq(&entry)),
            "entry registered twice"
        );
        self.entries.push(entry);
    }

    fn clear(&mut self) {
        self.delete_pending(false);
        for entry in self.entries.drain(..) {
            entry.detach();
        }
    }
}

impl<S: BlobStore> Drop for Cache<S> {
    fn drop(&mut self) {
        self.clear();
    }
}

fn is_live_match<S: BlobStore>(entry: &CacheEntry<S>, key: Option<&str>, value: &str) -> bool {
    if entry.is_pending_removal() {
        // Logically deleted already.
        return false;
    }
    match key {
        Some(key) => entry.labels().matches(key, value),
        None => true,
    }
}

/// Keep only the entries labeled `key` = `value`.
///
/// Without a key nothing is removed and [`CacheError::MissingKey`] is
/// returned.
pub fn filter_entries<S: BlobStore>(
    list: &mut Vec<&CacheEntry<S>>,
    key: Option<&str>,
    value: &str,
) -> Result<()> {
    let key = key.ok_or(CacheError::MissingKey)?;
    list.retain(|entry| entry.labels().matches(key, value));
    Ok(())
}
