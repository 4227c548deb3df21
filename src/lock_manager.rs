//! Per-page shared/exclusive latches with writer-preference queueing.
//!
//! Grounded on the teacher's `GuardWrapper` enum (a tagged Read/Write
//! release handle) but rebuilt on `std::sync::{Mutex, Condvar}` instead of
//! the teacher's lock-free atomic version counters, per this spec's
//! simpler coordinator-lock-plus-latch concurrency model.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::types::PageNo;

struct LatchState {
    readers: u32,
    writer: bool,
    waiting_writers: u32,
}

struct Latch {
    state: Mutex<LatchState>,
    cv: Condvar,
}

impl Latch {
    fn new() -> Self {
        Latch {
            state: Mutex::new(LatchState {
                readers: 0,
                writer: false,
                waiting_writers: 0,
            }),
            cv: Condvar::new(),
        }
    }

    fn acquire_shared(self: &Arc<Self>) {
        let mut state = self.state.lock().expect("latch mutex poisoned");
        while state.writer || state.waiting_writers > 0 {
            state = self.cv.wait(state).expect("latch mutex poisoned");
        }
        state.readers += 1;
    }

    fn release_shared(&self) {
        let mut state = self.state.lock().expect("latch mutex poisoned");
        state.readers -= 1;
        if state.readers == 0 {
            self.cv.notify_all();
        }
    }

    fn acquire_exclusive(self: &Arc<Self>) {
        let mut state = self.state.lock().expect("latch mutex poisoned");
        state.waiting_writers += 1;
        while state.writer || state.readers > 0 {
            state = self.cv.wait(state).expect("latch mutex poisoned");
        }
        state.waiting_writers -= 1;
        state.writer = true;
    }

    fn release_exclusive(&self) {
        let mut state = self.state.lock().expect("latch mutex poisoned");
        state.writer = false;
        self.cv.notify_all();
    }
}

/// A release handle for a page latch. Releases on drop — there is no
/// separate "unlock" call, so every acquisition is paired with a release
/// on every exit path, including panics that unwind.
pub enum LatchGuard {
    Shared(Arc<Latch>),
    Exclusive(Arc<Latch>),
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        match self {
            LatchGuard::Shared(latch) => latch.release_shared(),
            LatchGuard::Exclusive(latch) => latch.release_exclusive(),
        }
    }
}

/// A lazy map from page number to a reader-writer latch.
#[derive(Default)]
pub struct LatchManager {
    latches: Mutex<HashMap<PageNo, Arc<Latch>>>,
}

impl LatchManager {
    pub fn new() -> Self {
        LatchManager {
            latches: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, page: PageNo) -> Arc<Latch> {
        let mut latches = self.latches.lock().expect("latch map poisoned");
        latches.entry(page).or_insert_with(|| Arc::new(Latch::new())).clone()
    }

    pub fn acquire_shared(&self, page: PageNo) -> LatchGuard {
        let latch = self.entry(page);
        latch.acquire_shared();
        LatchGuard::Shared(latch)
    }

    pub fn acquire_exclusive(&self, page: PageNo) -> LatchGuard {
        let latch = self.entry(page);
        latch.acquire_exclusive();
        LatchGuard::Exclusive(latch)
    }

    /// Clears all latches. Callers must have released every handle first.
    pub fn reset(&self) {
        let mut latches = self.latches.lock().expect("latch map poisoned");
        latches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn shared_latches_allow_concurrent_readers() {
        let mgr = Arc::new(LatchManager::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let mgr = mgr.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                let _g = mgr.acquire_shared(7);
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(std::time::Duration::from_millis(5));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn exclusive_excludes_others() {
        let mgr = LatchManager::new();
        let g1 = mgr.acquire_exclusive(3);
        drop(g1);
        let _g2 = mgr.acquire_shared(3);
    }
}
