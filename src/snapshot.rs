use parking_lot::RwLock;
use std::sync::Arc;

/// Holds an immutable, atomically-swappable view of some startup-loaded state
/// (signature rule sets, the anomaly model). A reload replaces the whole `Arc`;
/// scans already in flight keep the `Arc` clone they took at dispatch time.
pub struct Snapshot<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> Snapshot<T> {
    pub fn new(value: T) -> Self {
        Snapshot {
            inner: RwLock::new(Arc::new(value)),
        }
    }

    pub fn load(&self) -> Arc<T> {
        self.inner.read().clone()
    }

    pub fn store(&self, value: T) {
        *self.inner.write() = Arc::new(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_replaces_without_affecting_existing_clones() {
        let snap = Snapshot::new(1);
        let old = snap.load();
        snap.store(2);
        assert_eq!(*old, 1);
        assert_eq!(*snap.load(), 2);
    }
}
