//! Epoch-deferred resource reclamation.
//!
//! Readers and compaction workers acquire a [`Guard`] before touching level
//! snapshots. A table dropped from a level is handed to the active guard via
//! [`Guard::delete`]; its actual drop (and file removal, for tables marked
//! deleted) is deferred until every guard that was live at deferral time has
//! finished. A reader holding a pre-replacement snapshot therefore never sees
//! its table files vanish underneath it.
//!
//! The scheme is the usual epoch list: a global epoch counter, a multiset of
//! active guard epochs, and batches of deferred resources stamped with the
//! epoch at which they were retired. A batch is dropped once the minimum
//! active epoch moves past its stamp.

use std::any::Any;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

type Resource = Box<dyn Any + Send>;

/// Shared handle to the reclamation state; clones refer to the same manager.
#[derive(Clone)]
pub struct ResourceManager {
    state: Arc<Mutex<ManagerState>>,
}

struct ManagerState {
    epoch: u64,
    active: BTreeMap<u64, usize>,
    deferred: VecDeque<(u64, Vec<Resource>)>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ManagerState {
                epoch: 0,
                active: BTreeMap::new(),
                deferred: VecDeque::new(),
            })),
        }
    }

    pub fn acquire(&self) -> Guard {
        let mut state = self.state.lock().unwrap();
        let epoch = state.epoch;
        *state.active.entry(epoch).or_insert(0) += 1;
        Guard {
            mgr: self.clone(),
            epoch,
            deferred: Mutex::new(Vec::new()),
            finished: false,
        }
    }

    /// Number of resource batches still awaiting reclamation.
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().deferred.len()
    }

    fn finish(&self, guard_epoch: u64, retired: Vec<Resource>) {
        let mut collectable = Vec::new();
        {
            let mut state = self.state.lock().unwrap();

            if !retired.is_empty() {
                // Stamp with the current epoch and advance it, so only guards
                // already live can hold references into this batch.
                let stamp = state.epoch;
                state.epoch += 1;
                state.deferred.push_back((stamp, retired));
            }

            match state.active.get_mut(&guard_epoch) {
                Some(n) if *n > 1 => *n -= 1,
                _ => {
                    state.active.remove(&guard_epoch);
                }
            }

            let min_active = state.active.keys().next().copied().unwrap_or(u64::MAX);
            while let Some((stamp, _)) = state.deferred.front() {
                if *stamp < min_active {
                    collectable.push(state.deferred.pop_front().unwrap().1);
                } else {
                    break;
                }
            }
        }
        // Drop outside the lock; table drops may unlink files.
        drop(collectable);
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A scoped epoch pin. Release happens on [`Guard::done`] or on drop.
pub struct Guard {
    mgr: ResourceManager,
    epoch: u64,
    deferred: Mutex<Vec<Resource>>,
    finished: bool,
}

impl Guard {
    /// Defer dropping `resources` until no guard live right now remains.
    pub fn delete<T: Any + Send>(&self, resources: Vec<T>) {
        let mut deferred = self.deferred.lock().unwrap();
        deferred.extend(resources.into_iter().map(|r| Box::new(r) as Resource));
    }

    pub fn done(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let retired = std::mem::take(&mut *self.deferred.lock().unwrap());
        self.mgr.finish(self.epoch, retired);
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_deferred_until_concurrent_guard_done() {
        let mgr = ResourceManager::new();
        let drops = Arc::new(AtomicUsize::new(0));

        let reader = mgr.acquire();
        let writer = mgr.acquire();
        writer.delete(vec![Tracked(Arc::clone(&drops))]);
        writer.done();

        // The reader was live when the resource was retired, so nothing may
        // be dropped yet.
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(mgr.pending(), 1);

        reader.done();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.pending(), 0);
    }

    #[test]
    fn test_later_guard_does_not_block_collection() {
        let mgr = ResourceManager::new();
        let drops = Arc::new(AtomicUsize::new(0));

        let writer = mgr.acquire();
        writer.delete(vec![Tracked(Arc::clone(&drops))]);
        writer.done();

        // Acquired after the retirement; must not keep the batch alive.
        let late = mgr.acquire();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        late.done();
    }

    #[test]
    fn test_drop_releases_like_done() {
        let mgr = ResourceManager::new();
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let guard = mgr.acquire();
            guard.delete(vec![Tracked(Arc::clone(&drops))]);
            // Falls out of scope without done().
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guards_across_threads() {
        let mgr = ResourceManager::new();
        let drops = Arc::new(AtomicUsize::new(0));

        let reader = mgr.acquire();
        let mgr2 = mgr.clone();
        let drops2 = Arc::clone(&drops);
        std::thread::spawn(move || {
            let writer = mgr2.acquire();
            writer.delete(vec![Tracked(drops2)]);
            writer.done();
        })
        .join()
        .unwrap();

        assert_eq!(drops.load(Ordering::SeqCst), 0);
        reader.done();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
