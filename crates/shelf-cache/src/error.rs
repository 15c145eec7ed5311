use shelf_store::StoreError;
use thiserror::Error;

/// Errors surfaced by cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The entry is no longer part of a cache and has no mapped body.
    #[error("entry is detached from its cache")]
    Detached,

    #[error("a label key is required")]
    MissingKey,
}

pub type Result<T> = std::result::Result<T, CacheError>;
