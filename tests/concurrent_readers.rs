//! Concurrent range cursors over disjoint sub-ranges observe a
//! consistent snapshot of data written before they started.

use bptree_engine::Store;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

#[test]
fn concurrent_range_scans_over_disjoint_ranges() {
    let dir = tempdir().unwrap();
    let store = Arc::new(Store::open_path(dir.path().join("concurrent.db")).unwrap());

    for k in 0..300u64 {
        store.set(k, k.to_le_bytes()).unwrap();
    }

    let mut handles = Vec::new();
    for band in 0..3u64 {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            let lo = band * 100;
            let hi = lo + 99;
            let found = store.range(lo, hi).unwrap();
            assert_eq!(found.len(), 100);
            for (k, v) in found {
                assert_eq!(v, k.0.to_le_bytes().to_vec());
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}
