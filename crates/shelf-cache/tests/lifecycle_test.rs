use std::fs;
use std::time::Instant;

use shelf_cache::{BlobStore, Cache, CacheError, LabeledStore, Labels, StoreError};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

fn id_labels(id: &str) -> Labels {
    Labels::new().with("type", "consensus").with("id", id)
}

fn live_ids(cache: &Cache<LabeledStore>) -> Vec<String> {
    let mut all = Vec::new();
    cache.find_all(None, "", &mut all);
    let mut ids: Vec<_> = all
        .iter()
        .filter_map(|e| e.label("id").map(str::to_string))
        .collect();
    ids.sort();
    ids
}

/// Pending deletion waits for the last outside holder.
#[test]
fn test_pending_removal_scenario() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let mut cache = Cache::open(temp.path(), 16).unwrap();

    drop(cache.add(id_labels("a"), b"A").unwrap());
    let b = cache.add(id_labels("b"), b"B").unwrap();
    drop(cache.add(id_labels("c"), b"C").unwrap());
    assert_eq!(live_ids(&cache), ["a", "b", "c"]);

    b.mark_for_removal();
    assert_eq!(live_ids(&cache), ["a", "c"]);

    // Still held by us: refcount 2.
    assert_eq!(b.refcount(), 2);
    assert_eq!(cache.delete_pending(false).deleted, 0);
    assert!(cache.store().list().unwrap().contains(b.object_id()));

    let object = b.object_id().clone();
    drop(b);
    assert_eq!(cache.delete_pending(false).deleted, 1);
    assert!(!cache.store().list().unwrap().contains(&object));
    assert!(!temp.path().join(object.as_str()).exists());
    assert_eq!(cache.len(), 2);
}

/// One unreadable object must not cost the rest of the cache.
#[test]
fn test_reopen_skips_corrupt_object() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    {
        let mut store = LabeledStore::open(temp.path(), 16).unwrap();
        store.save_labeled(&id_labels("a"), b"A").unwrap();
        store.save_labeled(&id_labels("b"), b"B").unwrap();
    }
    fs::write(temp.path().join("2"), b"labels without terminator").unwrap();

    let mut cache = Cache::open(temp.path(), 16).unwrap();
    assert_eq!(cache.len(), 2);
    assert_eq!(live_ids(&cache), ["a", "b"]);
    assert!(cache.entries().all(|e| !e.is_mapped() && e.refcount() == 1));

    let stats = cache.rescan().unwrap();
    assert_eq!(stats.loaded, 2);
    assert_eq!(stats.skipped, 1);
}

#[test]
fn test_entries_persist_across_reopen() {
    let temp = TempDir::new().unwrap();
    {
        let mut cache = Cache::open(temp.path(), 16).unwrap();
        let labels = Labels::new().with("type", "consensus").with("flavor", "ns");
        let entry = cache.add(labels, b"network-status-version 3\n").unwrap();
        assert!(!entry.is_mapped());
        cache.close();
        // Closing detaches the handle we still hold.
        assert!(!entry.is_attached());
    }

    let cache = Cache::open(temp.path(), 16).unwrap();
    let entry = cache.find_first("flavor", "ns").unwrap();
    assert_eq!(entry.label("type"), Some("consensus"));
    assert_eq!(&*entry.body().unwrap(), b"network-status-version 3\n");
    assert!(cache.find_first("flavor", "microdesc").is_none());
}

#[test]
fn test_full_store_fails_add_cleanly() {
    let temp = TempDir::new().unwrap();
    let mut cache = Cache::open(temp.path(), 1).unwrap();
    cache.add(id_labels("a"), b"A").unwrap();

    let err = cache.add(id_labels("b"), b"B").unwrap_err();
    assert!(matches!(err, CacheError::Store(StoreError::Full { .. })));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_invalid_labels_fail_add_cleanly() {
    let temp = TempDir::new().unwrap();
    let mut cache = Cache::open(temp.path(), 4).unwrap();

    let err = cache
        .add(Labels::new().with("has space", "v"), b"x")
        .unwrap_err();
    assert!(matches!(err, CacheError::Store(StoreError::InvalidLabel { .. })));
    assert!(cache.is_empty());
    assert!(cache.store().list().unwrap().is_empty());
}

/// A forced delete unlinks the file, but a holder with a live mapping can
/// keep reading it.
#[test]
fn test_forced_delete_keeps_mapping_alive() {
    let temp = TempDir::new().unwrap();
    let mut cache = Cache::open(temp.path(), 4).unwrap();
    let entry = cache.add(id_labels("a"), b"mapped before delete").unwrap();
    entry.body().unwrap();
    entry.mark_for_removal();

    let report = cache.delete_pending(true);
    assert_eq!(report.deleted, 1);
    assert!(report.failed.is_empty());
    assert!(cache.store().list().unwrap().is_empty());

    assert_eq!(&*entry.body().unwrap(), b"mapped before delete");
}

#[test]
fn test_lazy_unmap_over_real_store() {
    let temp = TempDir::new().unwrap();
    let mut cache = Cache::open(temp.path(), 4).unwrap();
    let entry = cache.add(id_labels("a"), b"A").unwrap();
    let handle = entry.downgrade();
    assert_eq!(&*entry.body().unwrap(), b"A");
    drop(entry);

    assert_eq!(cache.unmap_lazy(Instant::now()), 1);
    let entry = handle.upgrade().unwrap();
    assert!(!entry.is_mapped());
    // Maps again on demand.
    assert_eq!(&*entry.body().unwrap(), b"A");
}

#[test]
fn test_second_cache_on_same_directory_is_refused() {
    let temp = TempDir::new().unwrap();
    let _cache = Cache::open(temp.path(), 4).unwrap();

    let err = Cache::open(temp.path(), 4).err().unwrap();
    assert!(matches!(err, CacheError::Store(StoreError::Locked { .. })));
}

#[test]
fn test_sandbox_registration_passes_through() {
    let temp = TempDir::new().unwrap();
    let cache = Cache::open(temp.path(), 2).unwrap();
    let mut cfg = shelf_cache::SandboxConfig::new();
    cache.register_with_sandbox(&mut cfg);

    assert!(cfg.is_allowed(&temp.path().join("1"), shelf_store::Access::Read));
}

/// A stray directory on a slot name is stepped over, not reused.
#[test]
fn test_add_steps_over_directory_in_slot() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("0")).unwrap();
    let mut cache = Cache::open(temp.path(), 4).unwrap();
    assert!(cache.is_empty());

    let entry = cache.add(id_labels("a"), b"A").unwrap();
    assert_eq!(entry.object_id().as_str(), "1");
    assert_eq!(&*entry.body().unwrap(), b"A");
    assert!(temp.path().join("0").is_dir());
}
