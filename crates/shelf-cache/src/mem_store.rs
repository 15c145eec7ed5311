//! In-memory [`BlobStore`] double with failure injection.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use shelf_store::{BlobStore, Labels, ObjectId, Result, StoreError};

#[derive(Clone)]
pub(crate) struct MemMapping(Rc<[u8]>);

impl AsRef<[u8]> for MemMapping {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Default)]
pub(crate) struct MemStore {
    objects: BTreeMap<u32, (Labels, Rc<[u8]>)>,
    next: u32,
    fail_saves: bool,
    fail_maps: bool,
    fail_removes: bool,
    unreadable: BTreeSet<u32>,
    map_calls: Cell<usize>,
}

impl MemStore {
    pub(crate) fn fail_saves(&mut self, fail: bool) {
        self.fail_saves = fail;
    }

    pub(crate) fn fail_maps(&mut self, fail: bool) {
        self.fail_maps = fail;
    }

    pub(crate) fn fail_removes(&mut self, fail: bool) {
        self.fail_removes = fail;
    }

    /// Store an object that every later map attempt reports as corrupt.
    pub(crate) fn insert_unreadable(&mut self) -> ObjectId {
        let slot = self.next;
        self.next += 1;
        self.objects.insert(slot, (Labels::new(), Rc::from(&b""[..])));
        self.unreadable.insert(slot);
        ObjectId::new(slot.to_string())
    }

    pub(crate) fn contains(&self, id: &ObjectId) -> bool {
        self.slot(id).is_some_and(|slot| self.objects.contains_key(&slot))
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }

    /// Number of map calls served so far.
    pub(crate) fn map_calls(&self) -> usize {
        self.map_calls.get()
    }

    fn slot(&self, id: &ObjectId) -> Option<u32> {
        id.as_str().parse().ok()
    }

    fn not_found(id: &ObjectId) -> StoreError {
        StoreError::NotFound {
            name: id.to_string(),
        }
    }
}

impl BlobStore for MemStore {
    type Mapping = MemMapping;

    fn list(&self) -> Result<Vec<ObjectId>> {
        Ok(self
            .objects
            .keys()
            .map(|slot| ObjectId::new(slot.to_string()))
            .collect())
    }

    fn save_labeled(&mut self, labels: &Labels, body: &[u8]) -> Result<ObjectId> {
        if self.fail_saves {
            return Err(StoreError::Io(std::io::Error::other("injected save failure")));
        }
        let slot = self.next;
        self.next += 1;
        self.objects.insert(slot, (labels.clone(), Rc::from(body)));
        Ok(ObjectId::new(slot.to_string()))
    }

    fn map_labeled(&self, id: &ObjectId) -> Result<(Labels, MemMapping)> {
        if self.fail_maps {
            return Err(StoreError::Io(std::io::Error::other("injected map failure")));
        }
        let slot = self.slot(id).ok_or_else(|| Self::not_found(id))?;
        if self.unreadable.contains(&slot) {
            return Err(StoreError::Corrupt {
                name: id.to_string(),
                reason: "unreadable".to_string(),
            });
        }
        let (labels, body) = self.objects.get(&slot).ok_or_else(|| Self::not_found(id))?;
        self.map_calls.set(self.map_calls.get() + 1);
        Ok((labels.clone(), MemMapping(Rc::clone(body))))
    }

    fn remove(&mut self, id: &ObjectId) -> Result<()> {
        if self.fail_removes {
            return Err(StoreError::Io(std::io::Error::other("injected remove failure")));
        }
        let slot = self.slot(id).ok_or_else(|| Self::not_found(id))?;
        self.unreadable.remove(&slot);
        self.objects
            .remove(&slot)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(id))
    }
}
