//! # shelf-store
//!
//! Labeled blob storage for Shelf.
//!
//! A store is a flat directory of immutable objects. Each object carries an
//! ordered list of key/value labels followed by its body, and is named by a
//! numbered slot below the store's capacity.
//!
//! ## Directory Layout
//!
//! ```text
//! ~/.shelf/cache/
//! ├── .lock        # exclusive opener lock
//! ├── 0            # labels \0 body
//! ├── 1
//! └── 2.tmp        # in-flight write, removed on next open
//! ```
//!
//! The cache engine only talks to storage through the [`BlobStore`] trait;
//! [`LabeledStore`] is the filesystem implementation.

mod dir;
pub mod labels;
pub mod sandbox;

pub use dir::{LabeledStore, MappedBlob};
pub use labels::{Label, Labels};
pub use sandbox::{Access, SandboxConfig, SandboxRule};

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Object not found: {name}")]
    NotFound { name: String },

    #[error("Store is full: all {max_entries} slots are in use")]
    Full { max_entries: u32 },

    #[error("Invalid label {key:?}: {reason}")]
    InvalidLabel { key: String, reason: String },

    #[error("Corrupt object {name}: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("Store at {path:?} is locked by another process")]
    Locked { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Name of one persisted object inside a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ObjectId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Persistence backend for labeled blobs.
///
/// Mapping an object yields a `Mapping` whose bytes are the object's body.
/// Dropping the mapping releases it; there is no separate unmap call.
pub trait BlobStore {
    type Mapping: AsRef<[u8]>;

    /// Every object currently stored.
    fn list(&self) -> Result<Vec<ObjectId>>;

    /// Persist a new object and return its identifier.
    fn save_labeled(&mut self, labels: &Labels, body: &[u8]) -> Result<ObjectId>;

    /// Map an object, returning its labels and its body.
    fn map_labeled(&self, id: &ObjectId) -> Result<(Labels, Self::Mapping)>;

    /// Map an object when only the body is needed.
    fn map_body(&self, id: &ObjectId) -> Result<Self::Mapping> {
        self.map_labeled(id).map(|(_, mapping)| mapping)
    }

    /// Length of an object's body in bytes. Stores that can answer without
    /// mapping the object should override this.
    fn body_len(&self, id: &ObjectId) -> Result<u64> {
        self.map_body(id).map(|mapping| mapping.as_ref().len() as u64)
    }

    fn remove(&mut self, id: &ObjectId) -> Result<()>;

    /// Record the paths this store needs in `cfg`.
    fn register_with_sandbox(&self, _cfg: &mut SandboxConfig) {}
}
