//! Filesystem-backed [`BlobStore`].

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use memmap2::Mmap;
use tracing::{debug, instrument, warn};

use crate::labels::{self, Labels};
use crate::sandbox::{Access, SandboxConfig};
use crate::{BlobStore, ObjectId, Result, StoreError};

const LOCK_FILE: &str = ".lock";
const TEMP_SUFFIX: &str = ".tmp";

/// A directory of labeled objects, named by slot number.
#[derive(Debug)]
pub struct LabeledStore {
    root: PathBuf,
    max_entries: u32,
    /// Held for the lifetime of the store; the lock is released on drop.
    _lock: File,
}

impl LabeledStore {
    /// Open (or create) the store at `root`, holding at most `max_entries`
    /// objects.
    ///
    /// Fails with [`StoreError::Locked`] if another store already has the
    /// directory open. Leftover temp files from interrupted writes are
    /// removed.
    pub fn open<P: AsRef<Path>>(root: P, max_entries: u32) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let lock_path = root.join(LOCK_FILE);
        let lock = File::create(&lock_path)?;
        match lock.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(StoreError::Locked { path: root });
            }
            Err(e) => return Err(StoreError::Io(e)),
        }

        let store = Self {
            root,
            max_entries,
            _lock: lock,
        };
        store.clean_tmpfiles()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    /// Total size in bytes of every stored object.
    pub fn usage(&self) -> Result<u64> {
        let mut total = 0u64;
        for slot in self.slots()? {
            match fs::metadata(self.slot_path(slot)) {
                Ok(meta) => total += meta.len(),
                // Removed between listing and stat; not ours to count.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::Io(e)),
            }
        }
        Ok(total)
    }

    fn slot_path(&self, slot: u32) -> PathBuf {
        self.root.join(slot.to_string())
    }

    fn temp_path(&self, slot: u32) -> PathBuf {
        self.root.join(format!("{}{}", slot, TEMP_SUFFIX))
    }

    /// Parse a canonical slot name ("0", "17"; not "017" or "+1").
    fn parse_slot(&self, name: &str) -> Option<u32> {
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let slot: u32 = name.parse().ok()?;
        if slot >= self.max_entries || slot.to_string() != name {
            return None;
        }
        Some(slot)
    }

    fn object_path(&self, id: &ObjectId) -> Result<PathBuf> {
        self.parse_slot(id.as_str())
            .map(|slot| self.slot_path(slot))
            .ok_or_else(|| StoreError::NotFound {
                name: id.to_string(),
            })
    }

    /// Slots holding a regular file, in ascending order.
    fn slots(&self) -> Result<Vec<u32>> {
        self.scan_slots(true)
    }

    /// Slot names in use by anything, files or not, in ascending order.
    fn taken_slots(&self) -> Result<Vec<u32>> {
        self.scan_slots(false)
    }

    fn scan_slots(&self, files_only: bool) -> Result<Vec<u32>> {
        let mut slots = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if files_only && !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(slot) = entry.file_name().to_str().and_then(|n| self.parse_slot(n)) {
                slots.push(slot);
            }
        }
        slots.sort_unstable();
        Ok(slots)
    }

    fn free_slot(&self) -> Result<u32> {
        // A directory squatting on a slot name would make the rename fail.
        let used = self.taken_slots()?;
        // `used` is sorted, so the first gap is the lowest free slot.
        let mut candidate = 0u32;
        for slot in used {
            if slot != candidate {
                break;
            }
            candidate += 1;
        }
        if candidate >= self.max_entries {
            return Err(StoreError::Full {
                max_entries: self.max_entries,
            });
        }
        Ok(candidate)
    }

    fn clean_tmpfiles(&self) -> Result<()> {
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(TEMP_SUFFIX));
            if is_temp && entry.file_type()?.is_file() {
                debug!("Removing stale temp file {:?}", path);
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Unable to remove stale temp file {:?}: {}", path, e);
                }
            }
        }
        Ok(())
    }

    fn open_object(&self, id: &ObjectId) -> Result<File> {
        let path = self.object_path(id)?;
        File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound {
                name: id.to_string(),
            },
            _ => StoreError::Io(e),
        })
    }

    fn map_file(&self, id: &ObjectId) -> Result<Mmap> {
        let file = self.open_object(id)?;
        if file.metadata()?.len() == 0 {
            return Err(StoreError::Corrupt {
                name: id.to_string(),
                reason: "empty file".to_string(),
            });
        }
        // Safety: objects are immutable once renamed into place; they are
        // only ever replaced by unlink, which keeps the mapping valid.
        let map = unsafe { Mmap::map(&file) }?;
        Ok(map)
    }
}

impl BlobStore for LabeledStore {
    type Mapping = MappedBlob;

    fn list(&self) -> Result<Vec<ObjectId>> {
        Ok(self
            .slots()?
            .into_iter()
            .map(|slot| ObjectId::new(slot.to_string()))
            .collect())
    }

    /// Written to a temp file first and renamed into place, so a crash never
    /// leaves a half-written object under a slot name.
    #[instrument(skip(self, labels, body), fields(body_len = body.len()), level = "debug")]
    fn save_labeled(&mut self, labels: &Labels, body: &[u8]) -> Result<ObjectId> {
        let header = labels.encode()?;
        let slot = self.free_slot()?;
        let temp_path = self.temp_path(slot);
        let path = self.slot_path(slot);

        let written = (|| -> io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(&header)?;
            file.write_all(body)?;
            file.sync_all()?;
            fs::rename(&temp_path, &path)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::Io(e));
        }

        debug!("Saved object {} ({} label(s))", slot, labels.len());
        Ok(ObjectId::new(slot.to_string()))
    }

    #[instrument(skip(self), level = "debug")]
    fn map_labeled(&self, id: &ObjectId) -> Result<(Labels, MappedBlob)> {
        let map = self.map_file(id)?;
        let (labels, body_start) = Labels::decode(id.as_str(), &map)?;
        Ok((labels, MappedBlob { map, body_start }))
    }

    /// Reads the label block only; the body is never touched.
    fn body_len(&self, id: &ObjectId) -> Result<u64> {
        let file = self.open_object(id)?;
        let total = file.metadata()?.len();
        let mut header = Vec::new();
        BufReader::new(file).read_until(labels::LABEL_TERMINATOR, &mut header)?;
        if header.last() != Some(&labels::LABEL_TERMINATOR) {
            return Err(StoreError::Corrupt {
                name: id.to_string(),
                reason: "missing label terminator".to_string(),
            });
        }
        Ok(total - header.len() as u64)
    }

    fn map_body(&self, id: &ObjectId) -> Result<MappedBlob> {
        let map = self.map_file(id)?;
        let body_start = labels::body_offset(id.as_str(), &map)?;
        Ok(MappedBlob { map, body_start })
    }

    fn remove(&mut self, id: &ObjectId) -> Result<()> {
        let path = self.object_path(id)?;
        fs::remove_file(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound {
                name: id.to_string(),
            },
            _ => StoreError::Io(e),
        })?;
        debug!("Removed object {}", id);
        Ok(())
    }

    fn register_with_sandbox(&self, cfg: &mut SandboxConfig) {
        cfg.allow(&self.root, Access::Read);
        for slot in 0..self.max_entries {
            let path = self.slot_path(slot);
            let temp = self.temp_path(slot);
            cfg.allow(&path, Access::Read);
            cfg.allow(&path, Access::Unlink);
            cfg.allow(&temp, Access::Write);
            cfg.allow(&temp, Access::Rename);
            cfg.allow(&temp, Access::Unlink);
        }
    }
}

/// A mapped object; derefs to its body.
pub struct MappedBlob {
    map: Mmap,
    body_start: usize,
}

impl MappedBlob {
    pub fn body(&self) -> &[u8] {
        &self.map[self.body_start..]
    }

    pub fn len(&self) -> usize {
        self.map.len() - self.body_start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AsRef<[u8]> for MappedBlob {
    fn as_ref(&self) -> &[u8] {
        self.body()
    }
}

impl fmt::Debug for MappedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedBlob")
            .field("mapped_len", &self.map.len())
            .field("body_len", &self.len())
            .finish()
    }
}
