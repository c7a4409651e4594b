// At-most-one in-flight probe per queue on this node.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

/// Mutex-guarded set of `(project, queue)` fingerprints with a probe or
/// task currently dispatched.
#[derive(Debug, Default)]
pub struct BusySet {
    subs: Mutex<HashSet<String>>,
}

impl BusySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self, key: &str) -> bool {
        self.subs.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.subs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.lock().is_empty()
    }

    fn try_claim(&self, key: &str) -> bool {
        self.subs.lock().insert(key.to_string())
    }

    fn release(&self, key: &str) {
        self.subs.lock().remove(key);
        trace!(key, "cleared busy");
    }
}

/// Holds a busy claim until dropped, which also covers unwinding handlers.
#[derive(Debug)]
pub struct BusyGuard {
    set: Arc<BusySet>,
    key: String,
}

impl BusyGuard {
    /// Test-and-set claim of a fingerprint; `None` when someone else holds
    /// it.
    pub fn claim(set: &Arc<BusySet>, key: &str) -> Option<BusyGuard> {
        if !set.try_claim(key) {
            return None;
        }
        trace!(key, "marked busy");
        Some(BusyGuard {
            set: set.clone(),
            key: key.to_string(),
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.set.release(&self.key);
    }
}
