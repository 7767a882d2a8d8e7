use crate::target::TargetState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// The set of currently monitored targets, keyed by pid. A single lock
/// guards the container; the signal thread iterates a snapshot of it to
/// reach in-flight helper children.
#[derive(Default)]
pub struct TargetRegistry {
    inner: Mutex<HashMap<i32, Arc<TargetState>>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target unless one with the same pid already exists.
    /// Returns whether the insertion happened; callers must not spawn a
    /// second monitor when it did not.
    pub fn insert_if_absent(&self, pid: i32, target: Arc<TargetState>) -> bool {
        let mut inner = self.inner.lock();
        if inner.contains_key(&pid) {
            return false;
        }
        inner.insert(pid, target);
        true
    }

    pub fn get(&self, pid: i32) -> Option<Arc<TargetState>> {
        self.inner.lock().get(&pid).cloned()
    }

    pub fn remove(&self, pid: i32) -> Option<Arc<TargetState>> {
        self.inner.lock().remove(&pid)
    }

    pub fn snapshot(&self) -> Vec<Arc<TargetState>> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
