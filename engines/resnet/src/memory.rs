//! Byte accounting for intermediate tensors.

use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::Array3;

use inferbench_core::{Error, Result};

/// Process-wide counters shared by every scope of one engine
#[derive(Debug, Default)]
pub struct MemoryTracker {
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held by tensors in open scopes
    pub fn live_bytes(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest `live_bytes` seen so far
    pub fn peak_bytes(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Open a scope; everything it holds is released when it is dropped
    pub fn scope(&self, slots: usize) -> MemoryScope<'_> {
        MemoryScope {
            tracker: self,
            tensors: vec![None; slots],
            bytes: 0,
        }
    }

    fn allocate(&self, bytes: usize) {
        let live = self.live.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.peak.fetch_max(live, Ordering::SeqCst);
    }

    fn free(&self, bytes: usize) {
        self.live.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// Owner of the tensors produced while evaluating one graph
#[derive(Debug)]
pub struct MemoryScope<'a> {
    tracker: &'a MemoryTracker,
    tensors: Vec<Option<Array3<f32>>>,
    bytes: usize,
}

fn size_of(tensor: &Array3<f32>) -> usize {
    tensor.len() * std::mem::size_of::<f32>()
}

impl MemoryScope<'_> {
    /// Store the value of slot `id`, replacing any previous value
    pub fn insert(&mut self, id: usize, tensor: Array3<f32>) -> Result<()> {
        let slot = self
            .tensors
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("tensor slot {}", id)))?;
        let bytes = size_of(&tensor);
        if let Some(previous) = slot.replace(tensor) {
            let freed = size_of(&previous);
            self.bytes -= freed;
            self.tracker.free(freed);
        }
        self.bytes += bytes;
        self.tracker.allocate(bytes);
        Ok(())
    }

    pub fn get(&self, id: usize) -> Result<&Array3<f32>> {
        self.tensors
            .get(id)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::not_found(format!("tensor {} is not live", id)))
    }

    /// Drop the value of slot `id` early
    pub fn release(&mut self, id: usize) {
        if let Some(tensor) = self.tensors.get_mut(id).and_then(Option::take) {
            let bytes = size_of(&tensor);
            self.bytes -= bytes;
            self.tracker.free(bytes);
        }
    }

    /// Bytes held by this scope
    pub fn live_bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for MemoryScope<'_> {
    fn drop(&mut self) {
        self.tracker.free(self.bytes);
        self.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_releases_on_drop() {
        let tracker = MemoryTracker::new();
        {
            let mut scope = tracker.scope(3);
            scope.insert(0, Array3::zeros((2, 2, 2))).unwrap();
            scope.insert(1, Array3::zeros((1, 4, 4))).unwrap();
            assert_eq!(scope.live_bytes(), 96);
            assert_eq!(tracker.live_bytes(), 96);

            scope.release(0);
            assert_eq!(tracker.live_bytes(), 64);
            assert!(scope.get(0).is_err());
            assert!(scope.get(1).is_ok());
        }
        assert_eq!(tracker.live_bytes(), 0);
        assert_eq!(tracker.peak_bytes(), 96);
    }

    #[test]
    fn test_replacing_a_slot_frees_the_old_value() {
        let tracker = MemoryTracker::new();
        let mut scope = tracker.scope(1);
        scope.insert(0, Array3::zeros((4, 1, 1))).unwrap();
        scope.insert(0, Array3::zeros((1, 1, 1))).unwrap();

        assert_eq!(tracker.live_bytes(), 4);
        assert!(scope.insert(5, Array3::zeros((1, 1, 1))).is_err());
    }
}
