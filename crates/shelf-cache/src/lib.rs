//! # shelf-cache
//!
//! A persistent, label-indexed object cache over a Shelf store.
//!
//! Objects are added once, found by label, mapped into memory the first
//! time their body is read, and unmapped or deleted only when nobody but the
//! cache holds them.
//!
//! ## Entry lifecycle
//!
//! ```text
//!   add ──► held (refcount ≥ 2) ──drop──► cache-only (refcount 1)
//!              ▲                              │   │
//!              └──────── clone / upgrade ─────┘   │ mark_for_removal
//!                                                 ▼ + delete_pending
//!                                              deleted
//! ```
//!
//! A cache-only entry that is still mapped is either unmapped straight away
//! (aggressive release) or stamped idle and unmapped by a later
//! [`Cache::unmap_lazy`] sweep.
//!
//! The cache is single-threaded: entries are `Rc`-based and neither `Send`
//! nor `Sync`.

mod cache;
mod entry;
mod error;
#[cfg(test)]
mod mem_store;

pub use cache::{filter_entries, Cache, RescanStats, SweepReport};
pub use entry::{Body, CacheEntry, EntryHandle, IdleSince};
pub use error::{CacheError, Result};

pub use shelf_store::{BlobStore, LabeledStore, Labels, ObjectId, SandboxConfig, StoreError};
