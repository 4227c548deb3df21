//! A value large enough to require an overflow chain survives close and
//! reopen, and `vacuum` reclaims pages freed by deleting it.

use bptree_engine::Store;
use tempfile::tempdir;

#[test]
fn large_value_survives_reopen_and_vacuum_reclaims_it() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("overflow.db");
    let big = vec![0x5Au8; 64 * 1024];

    {
        let store = Store::open_path(&path).unwrap();
        store.set(7u64, &big).unwrap();
        store.close().unwrap();
    }

    let store = Store::open_path(&path).unwrap();
    assert_eq!(store.get(7u64).unwrap(), Some(big.clone()));

    assert!(store.delete(7u64).unwrap());
    let (reclaimed, _remaining_free) = store.vacuum().unwrap();
    assert!(reclaimed > 0, "vacuum should have reclaimed overflow pages");
    assert_eq!(store.get(7u64).unwrap(), None);
}
