//! 400 inserts followed by deleting every even key, exercising leaf and
//! internal borrow/merge rebalancing, checked against `consistency_check`.

use bptree_engine::Store;
use tempfile::tempdir;

#[test]
fn bulk_insert_then_delete_evens_stays_consistent() {
    let dir = tempdir().unwrap();
    let store = Store::open_path(dir.path().join("rebalance.db")).unwrap();

    for k in 0..400u64 {
        store.set(k, k.to_le_bytes()).unwrap();
    }
    assert!(store.consistency_check().unwrap());

    for k in (0..400u64).step_by(2) {
        assert!(store.delete(k).unwrap());
    }
    assert!(store.consistency_check().unwrap());

    for k in 0..400u64 {
        let v = store.get(k).unwrap();
        if k % 2 == 0 {
            assert_eq!(v, None, "key {k} should have been deleted");
        } else {
            assert_eq!(v, Some(k.to_le_bytes().to_vec()));
        }
    }

    let remaining = store.keys(0u64, 399u64).unwrap();
    assert_eq!(remaining.len(), 200);
}
