//! A 200-key range scan across several leaf splits.

use bptree_engine::Store;
use tempfile::tempdir;

#[test]
fn range_scan_over_two_hundred_keys() {
    let dir = tempdir().unwrap();
    let store = Store::open_path(dir.path().join("range.db")).unwrap();

    for k in 0..200u64 {
        store.set(k, format!("value-{k}").into_bytes()).unwrap();
    }

    let all = store.range(0u64, 199u64).unwrap();
    assert_eq!(all.len(), 200);
    for (i, (k, v)) in all.iter().enumerate() {
        assert_eq!(k.0, i as u64);
        assert_eq!(*v, format!("value-{i}").into_bytes());
    }

    let middle = store.range(50u64, 99u64).unwrap();
    assert_eq!(middle.len(), 50);
    assert_eq!(middle.first().unwrap().0 .0, 50);
    assert_eq!(middle.last().unwrap().0 .0, 99);
}
