//! Cache entries: refcounted handles to one stored object.
//!
//! Every [`CacheEntry`] is one reference. Cloning is an incref and dropping
//! is a decref; the cache's own index holds exactly one clone while the
//! entry is listed. The decref that leaves only the index's clone moves the
//! entry to the cache-only state, where it is either unmapped at once
//! (aggressive release) or stamped idle for [`Cache::unmap_lazy`]. The last
//! decref frees the entry together with its mapping.
//!
//! [`Cache::unmap_lazy`]: crate::Cache::unmap_lazy

use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::ops::Deref;
use std::rc::{Rc, Weak};
use std::time::Instant;

use shelf_store::{BlobStore, Labels, ObjectId};
use tracing::debug;

use crate::{CacheError, Result};

/// When an entry last became cache-only while mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleSince {
    /// Held by someone other than the cache, freshly mapped, or unmapped.
    Never,
    Since(Instant),
}

impl IdleSince {
    /// True if the entry has been idle since at or before `cutoff`.
    pub fn is_idle_at(self, cutoff: Instant) -> bool {
        matches!(self, IdleSince::Since(at) if at <= cutoff)
    }
}

pub(crate) struct EntryInner<S: BlobStore> {
    object: ObjectId,
    labels: Labels,
    mapping: RefCell<Option<S::Mapping>>,
    pending_removal: Cell<bool>,
    release_aggressively: Cell<bool>,
    idle: Cell<IdleSince>,
    /// Cleared on detach. A detached entry is never mapped again.
    cache: RefCell<Option<Weak<RefCell<S>>>>,
}

impl<S: BlobStore> EntryInner<S> {
    fn is_attached(&self) -> bool {
        self.cache.borrow().is_some()
    }

    fn store(&self) -> Option<Rc<RefCell<S>>> {
        self.cache.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn is_mapped(&self) -> bool {
        self.mapping.borrow().is_some()
    }

    /// Only the cache's index still holds this entry.
    fn become_cache_only(&self) {
        if !self.is_mapped() {
            return;
        }
        if self.release_aggressively.get() && self.unmap() {
            return;
        }
        self.idle.set(IdleSince::Since(Instant::now()));
    }

    /// Drop the mapping. Returns false if a body view still borrows it, in
    /// which case nothing changes.
    fn unmap(&self) -> bool {
        let Ok(mut slot) = self.mapping.try_borrow_mut() else {
            debug!("Deferring unmap of object {}: body still borrowed", self.object);
            return false;
        };
        if slot.take().is_some() {
            debug!("Unmapped object {}", self.object);
        }
        self.idle.set(IdleSince::Never);
        true
    }
}

/// A reference to one cached object.
pub struct CacheEntry<S: BlobStore> {
    inner: Rc<EntryInner<S>>,
}

impl<S: BlobStore> CacheEntry<S> {
    /// A fresh, unmapped entry attached to `store`, with a single reference.
    pub(crate) fn new(object: ObjectId, labels: Labels, store: &Rc<RefCell<S>>) -> Self {
        Self {
            inner: Rc::new(EntryInner {
                object,
                labels,
                mapping: RefCell::new(None),
                pending_removal: Cell::new(false),
                release_aggressively: Cell::new(false),
                idle: Cell::new(IdleSince::Never),
                cache: RefCell::new(Some(Rc::downgrade(store))),
            }),
        }
    }

    /// Identifier of the persisted object behind this entry.
    pub fn object_id(&self) -> &ObjectId {
        &self.inner.object
    }

    pub fn labels(&self) -> &Labels {
        &self.inner.labels
    }

    /// Value of the first label named `key`.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.inner.labels.get(key)
    }

    /// Number of outstanding references, including the cache's own.
    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    pub fn is_mapped(&self) -> bool {
        self.inner.is_mapped()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.is_attached()
    }

    pub fn is_pending_removal(&self) -> bool {
        self.inner.pending_removal.get()
    }

    pub fn releases_aggressively(&self) -> bool {
        self.inner.release_aggressively.get()
    }

    pub fn idle_since(&self) -> IdleSince {
        self.inner.idle.get()
    }

    /// Hide the entry from lookups and let the next
    /// [`Cache::delete_pending`](crate::Cache::delete_pending) sweep delete
    /// it once nobody else holds it.
    pub fn mark_for_removal(&self) {
        self.inner.pending_removal.set(true);
    }

    /// Unmap as soon as the cache is the only holder, instead of waiting for
    /// a lazy sweep.
    pub fn mark_for_aggressive_release(&self) {
        self.inner.release_aggressively.set(true);
    }

    /// The object's body, mapping it first if needed.
    ///
    /// The view borrows from this handle, so it cannot outlive the reference
    /// it was obtained through. Fails with [`CacheError::Detached`] if the
    /// entry is unmapped and no longer belongs to a cache.
    pub fn body(&self) -> Result<Body<'_>> {
        if !self.inner.is_mapped() {
            let store = self.inner.store().ok_or(CacheError::Detached)?;
            let mapping = store.borrow().map_body(&self.inner.object)?;
            *self.inner.mapping.borrow_mut() = Some(mapping);
            self.inner.idle.set(IdleSince::Never);
            debug!("Mapped object {}", self.inner.object);
        }

        let bytes = Ref::map(self.inner.mapping.borrow(), |slot| {
            slot.as_ref().map_or(&[][..], |mapping| mapping.as_ref())
        });
        Ok(Body { bytes })
    }

    /// Length of the body in bytes. Does not map the entry; an unmapped entry
    /// asks its store.
    pub fn body_len(&self) -> Result<u64> {
        if let Some(mapping) = self.inner.mapping.borrow().as_ref() {
            return Ok(mapping.as_ref().len() as u64);
        }
        let store = self.inner.store().ok_or(CacheError::Detached)?;
        let len = store.borrow().body_len(&self.inner.object)?;
        Ok(len)
    }

    /// A non-owning handle that can later be upgraded back to a reference,
    /// or fails to upgrade once the entry is freed.
    pub fn downgrade(&self) -> EntryHandle<S> {
        EntryHandle {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// True if both references point at the same entry.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn detach(&self) {
        *self.inner.cache.borrow_mut() = None;
    }

    pub(crate) fn unmap(&self) -> bool {
        self.inner.unmap()
    }
}

impl<S: BlobStore> Clone for CacheEntry<S> {
    fn clone(&self) -> Self {
        self.inner.idle.set(IdleSince::Never);
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<S: BlobStore> Drop for CacheEntry<S> {
    fn drop(&mut self) {
        // The count this reference leaves behind.
        let remaining = Rc::strong_count(&self.inner) - 1;
        if remaining == 1 && self.inner.is_attached() {
            self.inner.become_cache_only();
        }
        // At zero the Rc frees the entry, and its mapping with it.
    }
}

impl<S: BlobStore> fmt::Debug for CacheEntry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("object", &self.inner.object)
            .field("labels", &self.inner.labels)
            .field("refcount", &self.refcount())
            .field("mapped", &self.is_mapped())
            .field("attached", &self.is_attached())
            .field("pending_removal", &self.is_pending_removal())
            .finish()
    }
}

/// Weak handle to an entry.
pub struct EntryHandle<S: BlobStore> {
    inner: Weak<EntryInner<S>>,
}

impl<S: BlobStore> EntryHandle<S> {
    /// Take a new reference, or `None` if the entry has been freed.
    pub fn upgrade(&self) -> Option<CacheEntry<S>> {
        let inner = self.inner.upgrade()?;
        inner.idle.set(IdleSince::Never);
        Some(CacheEntry { inner })
    }

    pub fn is_live(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl<S: BlobStore> Clone for EntryHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<S: BlobStore> fmt::Debug for EntryHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryHandle")
            .field("live", &self.is_live())
            .finish()
    }
}

/// Read-only view of a mapped body.
pub struct Body<'a> {
    bytes: Ref<'a, [u8]>,
}

impl Deref for Body<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsRef<[u8]> for Body<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for Body<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body").field("len", &self.bytes.len()).finish()
    }
}
