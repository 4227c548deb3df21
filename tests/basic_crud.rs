//! Basic get/set/delete against a freshly opened store.

use bptree_engine::Store;
use tempfile::tempdir;

#[test]
fn put_get_overwrite_delete() {
    let dir = tempdir().unwrap();
    let store = Store::open_path(dir.path().join("basic.db")).unwrap();

    assert_eq!(store.get(1u64).unwrap(), None);
    store.set(1u64, b"first").unwrap();
    assert_eq!(store.get(1u64).unwrap(), Some(b"first".to_vec()));

    store.set(1u64, b"second").unwrap();
    assert_eq!(store.get(1u64).unwrap(), Some(b"second".to_vec()));

    assert!(store.delete(1u64).unwrap());
    assert_eq!(store.get(1u64).unwrap(), None);
    assert!(!store.delete(1u64).unwrap());
}
