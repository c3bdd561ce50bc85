//! Process-wide collaborators shared by every graph handle.

use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    Arc,
};

use anyhow::Result;

use crate::{
    allocator::{CachingAllocator, HookedAllocator, MempoolId},
    config::GraphConfig,
    driver::Driver,
    error::GraphError,
    rng::GeneratorRegistry,
};

/// The driver, allocator, RNG registry and the small amount of global state
/// the capture code consults. Graph handles borrow it through an `Arc`.
pub struct GraphContext<D: Driver> {
    driver: Arc<D>,
    allocator: Arc<dyn CachingAllocator<D::Stream>>,
    generators: GeneratorRegistry,
    config: GraphConfig,
    debug: AtomicBool,
    pending_event_queries: AtomicI64,
    next_private_pool: AtomicU64,
    next_user_pool: AtomicU64,
    next_capture_token: AtomicU64,
}

impl<D: Driver> GraphContext<D> {
    pub fn new(
        driver: Arc<D>,
        allocator: Arc<dyn CachingAllocator<D::Stream>>,
        generators: GeneratorRegistry,
        config: GraphConfig,
    ) -> Self {
        let debug = AtomicBool::new(config.debug);
        Self {
            driver,
            allocator,
            generators,
            config,
            debug,
            pending_event_queries: AtomicI64::new(0),
            next_private_pool: AtomicU64::new(1),
            next_user_pool: AtomicU64::new(1),
            next_capture_token: AtomicU64::new(1),
        }
    }

    /// A context backed by a [`HookedAllocator`] over `driver`.
    pub fn with_driver(driver: Arc<D>, config: GraphConfig) -> Self {
        let allocator = Arc::new(HookedAllocator::new(Arc::clone(&driver)));
        Self::new(driver, allocator, GeneratorRegistry::default(), config)
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn allocator(&self) -> &Arc<dyn CachingAllocator<D::Stream>> {
        &self.allocator
    }

    pub fn generators(&self) -> &GeneratorRegistry {
        &self.generators
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// A fresh pool id that several graphs can capture into.
    pub fn graph_pool_handle(&self) -> MempoolId {
        MempoolId(0, self.next_user_pool.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn private_pool(&self) -> MempoolId {
        MempoolId(self.next_private_pool.fetch_add(1, Ordering::Relaxed), 0)
    }

    pub(crate) fn next_capture_token(&self) -> u64 {
        self.next_capture_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Retain captured graphs after instantiation so `debug_dump` can print them.
    /// Must be enabled before the graph is instantiated.
    pub fn enable_debug_mode(&self) {
        self.debug.store(true, Ordering::Release);
    }

    pub fn debug_mode(&self) -> bool {
        self.debug.load(Ordering::Acquire)
    }

    /// Called by watchers (e.g. a collective-communication watchdog) before
    /// they query an event. Capture waits for these to drain.
    pub fn inc_pending_event_queries(&self) {
        self.pending_event_queries.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_pending_event_queries(&self) -> Result<()> {
        self.pending_event_queries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n - 1)
            })
            .map_err(|_| {
                GraphError::misuse(
                    "attempted to decrement the number of outstanding event queries, but it was <= 0",
                )
            })?;
        Ok(())
    }

    pub fn num_pending_event_queries(&self) -> i64 {
        self.pending_event_queries.load(Ordering::Acquire)
    }
}
