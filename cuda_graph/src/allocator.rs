//! Allocator hooks used while capturing.
//!
//! The caching allocator is an external collaborator; [`CachingAllocator`] is
//! the contract the graph code needs from it. [`HookedAllocator`] is a small
//! implementation on top of a [`Driver`] that honors pool steering, sentinel
//! sessions and private-pool lifetimes.

use std::{collections::HashMap, fmt, sync::Arc};

use anyhow::Result;
use parking_lot::Mutex;

use crate::{
    driver::{DeviceIndex, DevicePtr, Driver},
    error::GraphError,
};

/// Decides whether an allocation on a stream belongs to a session.
pub type StreamFilter<S> = Arc<dyn Fn(S) -> bool + Send + Sync>;

/// Produces the pointer returned for an intercepted allocation of `size` bytes.
pub type FakeAllocator = Box<dyn FnMut(usize) -> DevicePtr + Send>;

/// Memory pool id. Exactly one of the two halves is non-zero: `.0` for pools
/// created privately by a capture, `.1` for pools created through
/// `graph_pool_handle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MempoolId(pub u64, pub u64);

impl MempoolId {
    pub fn is_unset(&self) -> bool {
        self.0 == 0 && self.1 == 0
    }
}

pub trait CachingAllocator<S>: Send + Sync {
    /// Steer real allocations on `device` whose stream passes `filter` into `pool`.
    fn begin_allocate_to_pool(&self, device: DeviceIndex, pool: MempoolId, filter: StreamFilter<S>);
    fn end_allocate_to_pool(&self, device: DeviceIndex, pool: MempoolId);
    /// Drop one use of `pool`; its memory goes back to the driver once unused.
    fn release_pool(&self, device: DeviceIndex, pool: MempoolId) -> Result<()>;

    /// Satisfy allocations on `device` whose stream passes `filter` with `fake`.
    fn begin_allocate_sentinel_pointers(
        &self,
        device: DeviceIndex,
        filter: StreamFilter<S>,
        fake: FakeAllocator,
        token: u64,
    );
    /// Unregister the sentinel session `token`. Unknown tokens are ignored.
    fn end_allocate_sentinel_pointers(&self, token: u64);

    fn raw_alloc_with_stream(&self, size: usize, stream: S) -> Result<DevicePtr>;
    fn raw_delete(&self, ptr: DevicePtr) -> Result<()>;
}

struct PoolSession<S> {
    device: DeviceIndex,
    pool: MempoolId,
    filter: StreamFilter<S>,
}

struct SentinelSession<S> {
    device: DeviceIndex,
    filter: StreamFilter<S>,
    fake: FakeAllocator,
    token: u64,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    size: usize,
    pool: Option<MempoolId>,
}

#[derive(Debug, Default)]
struct PrivatePool {
    use_count: usize,
    /// Freed blocks parked for reuse by later allocations into the pool.
    cached: Vec<(DevicePtr, usize)>,
}

struct State<S> {
    pool_sessions: Vec<PoolSession<S>>,
    sentinel_sessions: Vec<SentinelSession<S>>,
    live: HashMap<DevicePtr, Block>,
    pools: HashMap<MempoolId, PrivatePool>,
    /// Sentinel pointers handed out and not yet freed, with multiplicity.
    sentinels: HashMap<DevicePtr, usize>,
}

impl<S> Default for State<S> {
    fn default() -> Self {
        Self {
            pool_sessions: Vec::new(),
            sentinel_sessions: Vec::new(),
            live: HashMap::new(),
            pools: HashMap::new(),
            sentinels: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocatorStats {
    /// Real blocks currently handed out.
    pub live_blocks: usize,
    /// Freed blocks parked in private pools.
    pub cached_blocks: usize,
    pub pools: usize,
    pub sentinel_sessions: usize,
    pub pool_sessions: usize,
    /// Distinct sentinel addresses handed out and not yet freed.
    pub sentinel_pointers: usize,
}

pub struct HookedAllocator<D: Driver> {
    driver: Arc<D>,
    state: Mutex<State<D::Stream>>,
}

impl<D: Driver> fmt::Debug for HookedAllocator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookedAllocator")
            .field("stats", &self.stats())
            .finish()
    }
}

impl<D: Driver> HookedAllocator<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self {
            driver,
            state: Mutex::new(State::default()),
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        AllocatorStats {
            live_blocks: state.live.len(),
            cached_blocks: state.pools.values().map(|p| p.cached.len()).sum(),
            pools: state.pools.len(),
            sentinel_sessions: state.sentinel_sessions.len(),
            pool_sessions: state.pool_sessions.len(),
            sentinel_pointers: state.sentinels.len(),
        }
    }

    pub fn pool_use_count(&self, pool: MempoolId) -> usize {
        self.state
            .lock()
            .pools
            .get(&pool)
            .map_or(0, |p| p.use_count)
    }
}

impl<D: Driver> CachingAllocator<D::Stream> for HookedAllocator<D> {
    fn begin_allocate_to_pool(
        &self,
        device: DeviceIndex,
        pool: MempoolId,
        filter: StreamFilter<D::Stream>,
    ) {
        let mut state = self.state.lock();
        state.pools.entry(pool).or_default().use_count += 1;
        state.pool_sessions.push(PoolSession {
            device,
            pool,
            filter,
        });
    }

    fn end_allocate_to_pool(&self, device: DeviceIndex, pool: MempoolId) {
        self.state
            .lock()
            .pool_sessions
            .retain(|s| !(s.device == device && s.pool == pool));
    }

    fn release_pool(&self, _device: DeviceIndex, pool: MempoolId) -> Result<()> {
        let cached = {
            let mut state = self.state.lock();
            let Some(entry) = state.pools.get_mut(&pool) else {
                tracing::debug!(?pool, "release of unknown pool ignored");
                return Ok(());
            };
            entry.use_count = entry.use_count.saturating_sub(1);
            if entry.use_count > 0 {
                return Ok(());
            }
            state.pools.remove(&pool).map(|p| p.cached).unwrap_or_default()
        };
        for (ptr, _) in cached {
            self.driver.mem_free(ptr)?;
        }
        Ok(())
    }

    fn begin_allocate_sentinel_pointers(
        &self,
        device: DeviceIndex,
        filter: StreamFilter<D::Stream>,
        fake: FakeAllocator,
        token: u64,
    ) {
        self.state.lock().sentinel_sessions.push(SentinelSession {
            device,
            filter,
            fake,
            token,
        });
    }

    fn end_allocate_sentinel_pointers(&self, token: u64) {
        self.state
            .lock()
            .sentinel_sessions
            .retain(|s| s.token != token);
    }

    fn raw_alloc_with_stream(&self, size: usize, stream: D::Stream) -> Result<DevicePtr> {
        let device = self.driver.stream_device(stream)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(session) = state
            .sentinel_sessions
            .iter_mut()
            .find(|s| s.device == device && (s.filter)(stream))
        {
            let ptr = (session.fake)(size);
            if ptr == 0 {
                return Err(GraphError::OutOfMemory { requested: size }.into());
            }
            *state.sentinels.entry(ptr).or_default() += 1;
            return Ok(ptr);
        }

        let pool = state
            .pool_sessions
            .iter()
            .find(|s| s.device == device && (s.filter)(stream))
            .map(|s| s.pool);

        if let Some(pool) = pool {
            let reuse = state.pools.get_mut(&pool).and_then(|p| {
                let best = p
                    .cached
                    .iter()
                    .enumerate()
                    .filter(|(_, (_, sz))| *sz >= size)
                    .min_by_key(|(_, (_, sz))| *sz)
                    .map(|(i, _)| i)?;
                Some(p.cached.swap_remove(best))
            });
            if let Some((ptr, block_size)) = reuse {
                state.live.insert(
                    ptr,
                    Block {
                        size: block_size,
                        pool: Some(pool),
                    },
                );
                return Ok(ptr);
            }
        }

        let ptr = self.driver.mem_alloc(size, stream).map_err(|e| {
            tracing::warn!("device allocation of {size} bytes failed: {e}");
            GraphError::OutOfMemory { requested: size }
        })?;
        state.live.insert(ptr, Block { size, pool });
        Ok(ptr)
    }

    fn raw_delete(&self, ptr: DevicePtr) -> Result<()> {
        let block = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(count) = state.sentinels.get_mut(&ptr) {
                *count -= 1;
                if *count == 0 {
                    state.sentinels.remove(&ptr);
                }
                return Ok(());
            }
            let block = state
                .live
                .remove(&ptr)
                .ok_or(GraphError::UnknownAllocation(ptr))?;
            if let Some(pool) = block.pool.and_then(|id| state.pools.get_mut(&id)) {
                pool.cached.push((ptr, block.size));
                return Ok(());
            }
            block
        };
        tracing::trace!(ptr, size = block.size, "returning block to the driver");
        self.driver.mem_free(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        recorder::AllocationRecorder,
        sentinel::{SentinelLayout, SentinelMode},
        sim::SimDriver,
    };

    fn setup() -> (Arc<SimDriver>, HookedAllocator<SimDriver>) {
        let driver = Arc::new(SimDriver::new());
        let allocator = HookedAllocator::new(Arc::clone(&driver));
        (driver, allocator)
    }

    #[test]
    fn sentinel_sessions_are_tried_in_registration_order() -> Result<()> {
        let (driver, allocator) = setup();
        let stream = driver.create_stream();
        allocator.begin_allocate_sentinel_pointers(0, Arc::new(|_| false), Box::new(|_| 111), 1);
        allocator.begin_allocate_sentinel_pointers(0, Arc::new(|_| true), Box::new(|_| 222), 2);
        allocator.begin_allocate_sentinel_pointers(0, Arc::new(|_| true), Box::new(|_| 333), 3);
        assert_eq!(allocator.raw_alloc_with_stream(64, stream)?, 222);

        allocator.end_allocate_sentinel_pointers(2);
        assert_eq!(allocator.raw_alloc_with_stream(64, stream)?, 333);

        // Unknown tokens are ignored.
        allocator.end_allocate_sentinel_pointers(42);
        allocator.end_allocate_sentinel_pointers(3);
        allocator.end_allocate_sentinel_pointers(1);
        let real = allocator.raw_alloc_with_stream(64, stream)?;
        assert!(real != 222 && real != 333);
        assert_eq!(allocator.stats().live_blocks, 1);

        allocator.raw_delete(222)?;
        allocator.raw_delete(333)?;
        allocator.raw_delete(real)?;
        assert_eq!(allocator.stats().live_blocks, 0);
        Ok(())
    }

    #[test]
    fn sentinel_accounting_is_bounded_by_one_capture() -> Result<()> {
        let (driver, allocator) = setup();
        let stream = driver.create_stream();
        let recorder = AllocationRecorder::new();
        for token in 1..=2 {
            recorder.reset();
            let fake = recorder.fake_allocator(SentinelMode::Distinct, SentinelLayout::default());
            allocator.begin_allocate_sentinel_pointers(0, Arc::new(|_| true), fake, token);
            // Inputs and outputs are never freed.
            for _ in 0..3 {
                allocator.raw_alloc_with_stream(16, stream)?;
            }
            allocator.end_allocate_sentinel_pointers(token);
            assert_eq!(allocator.stats().sentinel_pointers, 3);
        }
        Ok(())
    }

    #[test]
    fn null_sentinel_is_out_of_memory() {
        let (driver, allocator) = setup();
        let stream = driver.create_stream();
        allocator.begin_allocate_sentinel_pointers(0, Arc::new(|_| true), Box::new(|_| 0), 1);
        let err = allocator.raw_alloc_with_stream(8, stream).unwrap_err();
        assert_eq!(
            err.downcast_ref::<GraphError>(),
            Some(&GraphError::OutOfMemory { requested: 8 })
        );
    }

    #[test]
    fn sessions_on_other_devices_do_not_match() -> Result<()> {
        let (driver, allocator) = setup();
        let stream = driver.create_stream();
        allocator.begin_allocate_sentinel_pointers(1, Arc::new(|_| true), Box::new(|_| 4096), 1);
        let ptr = allocator.raw_alloc_with_stream(8, stream)?;
        assert_ne!(ptr, 4096);
        allocator.raw_delete(ptr)
    }

    #[test]
    fn pool_blocks_are_parked_until_release() -> Result<()> {
        let (driver, allocator) = setup();
        let stream = driver.create_stream();
        let pool = MempoolId(1, 0);
        allocator.begin_allocate_to_pool(0, pool, Arc::new(|_| true));

        let a = allocator.raw_alloc_with_stream(256, stream)?;
        allocator.raw_delete(a)?;
        assert_eq!(allocator.stats().cached_blocks, 1);

        // A smaller request reuses the parked block.
        let b = allocator.raw_alloc_with_stream(128, stream)?;
        assert_eq!(a, b);
        allocator.raw_delete(b)?;
        allocator.end_allocate_to_pool(0, pool);
        assert_eq!(allocator.stats().pool_sessions, 0);

        allocator.release_pool(0, pool)?;
        let stats = allocator.stats();
        assert_eq!((stats.cached_blocks, stats.pools), (0, 0));
        assert_eq!(driver.live_allocations(), 0);
        Ok(())
    }

    #[test]
    fn shared_pool_survives_first_release() -> Result<()> {
        let (driver, allocator) = setup();
        let stream = driver.create_stream();
        let pool = MempoolId(0, 7);
        allocator.begin_allocate_to_pool(0, pool, Arc::new(|_| true));
        allocator.begin_allocate_to_pool(0, pool, Arc::new(|_| true));
        assert_eq!(allocator.pool_use_count(pool), 2);
        let a = allocator.raw_alloc_with_stream(64, stream)?;
        allocator.raw_delete(a)?;
        allocator.release_pool(0, pool)?;
        assert_eq!(allocator.stats().cached_blocks, 1);
        allocator.release_pool(0, pool)?;
        assert_eq!(allocator.stats().cached_blocks, 0);
        Ok(())
    }

    #[test]
    fn unknown_pointer_is_an_error() {
        let (_, allocator) = setup();
        let err = allocator.raw_delete(0xabc).unwrap_err();
        assert_eq!(
            err.downcast_ref::<GraphError>(),
            Some(&GraphError::UnknownAllocation(0xabc))
        );
    }
}
