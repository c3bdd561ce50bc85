//! Records the allocation schema of a sentinel capture.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    allocator::FakeAllocator,
    sentinel::{SentinelLayout, SentinelMode},
};

#[derive(Debug, Default)]
struct Recorded {
    sizes: Vec<usize>,
}

/// Shared between a graph handle and the fake allocator it registers.
#[derive(Debug, Clone, Default)]
pub struct AllocationRecorder {
    inner: Arc<Mutex<Recorded>>,
}

impl AllocationRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.inner.lock().sizes.clear();
    }

    /// The ordered byte sizes of every allocation seen so far.
    pub fn sizes(&self) -> Vec<usize> {
        self.inner.lock().sizes.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the allocator callback: record `size` and hand back the
    /// sentinel pointer for the allocation's position.
    pub fn fake_allocator(&self, mode: SentinelMode, layout: SentinelLayout) -> FakeAllocator {
        let inner = Arc::clone(&self.inner);
        Box::new(move |size| {
            let mut recorded = inner.lock();
            let index = recorded.sizes.len();
            recorded.sizes.push(size);
            let ptr = layout.pointer(mode, index);
            tracing::debug!(size, index, ptr, ?mode, "intercepted allocation");
            ptr
        })
    }
}
