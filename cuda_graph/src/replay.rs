//! Dynamic replay: relaunch a diffed sentinel graph against real buffers.

use std::sync::Arc;

use anyhow::Result;

use crate::{
    allocator::{CachingAllocator, MempoolId},
    context::GraphContext,
    driver::{CaptureMode, DeviceGuard, DevicePtr, Driver, KernelNodeUpdate},
    error::ensure_graph,
    graph::GraphHandle,
    sentinel::SentinelMode,
};

/// A device buffer handed to `replay_dynamic` in place of a recorded allocation.
pub trait ReplayBuffer {
    fn device_ptr(&self) -> DevicePtr;
    fn byte_len(&self) -> usize;
}

impl ReplayBuffer for (DevicePtr, usize) {
    fn device_ptr(&self) -> DevicePtr {
        self.0
    }

    fn byte_len(&self) -> usize {
        self.1
    }
}

impl<T: ReplayBuffer + ?Sized> ReplayBuffer for &T {
    fn device_ptr(&self) -> DevicePtr {
        (**self).device_ptr()
    }

    fn byte_len(&self) -> usize {
        (**self).byte_len()
    }
}

/// The leading buffers of a dynamic replay, in allocation order.
///
/// Usually derived with `#[derive(ReplayBuffers)]`.
pub trait PrefilledBuffers {
    fn prefilled(&self) -> Vec<(DevicePtr, usize)>;
}

impl<B: ReplayBuffer> PrefilledBuffers for [B] {
    fn prefilled(&self) -> Vec<(DevicePtr, usize)> {
        self.iter().map(|b| (b.device_ptr(), b.byte_len())).collect()
    }
}

/// Buffers for one dynamic replay: the caller's prefix followed by
/// allocations made for this replay only, which are freed on drop.
struct ReplayBufferPlan<'a, S> {
    allocator: &'a dyn CachingAllocator<S>,
    actual: Vec<DevicePtr>,
    prefilled: usize,
    scratch: Vec<DevicePtr>,
}

impl<'a, S: Copy> ReplayBufferPlan<'a, S> {
    fn new(
        allocator: &'a dyn CachingAllocator<S>,
        schema: &[usize],
        prefilled_ptrs: &[DevicePtr],
        stream: S,
    ) -> Result<Self> {
        let mut plan = Self {
            allocator,
            actual: Vec::with_capacity(schema.len()),
            prefilled: prefilled_ptrs.len(),
            scratch: Vec::new(),
        };
        plan.actual.extend_from_slice(prefilled_ptrs);
        for &size in &schema[prefilled_ptrs.len()..] {
            let ptr = allocator.raw_alloc_with_stream(size, stream)?;
            plan.actual.push(ptr);
        }
        Ok(plan)
    }

    fn actual(&self) -> &[DevicePtr] {
        &self.actual
    }

    /// A buffer freed together with the ephemeral ones.
    fn scratch(&mut self, size: usize, stream: S) -> Result<DevicePtr> {
        let ptr = self.allocator.raw_alloc_with_stream(size, stream)?;
        self.scratch.push(ptr);
        Ok(ptr)
    }
}

impl<S> Drop for ReplayBufferPlan<'_, S> {
    fn drop(&mut self) {
        let owned = self.scratch.iter().chain(&self.actual[self.prefilled..]);
        for &ptr in owned {
            if let Err(e) = self.allocator.raw_delete(ptr) {
                tracing::warn!("failed to free replay buffer {ptr:#x}: {e}");
            }
        }
    }
}

impl<D: Driver> GraphHandle<D> {
    /// Launch the diffed graph with `prefilled_ptrs` standing in for the first
    /// recorded allocations and fresh buffers for the rest.
    pub fn replay_dynamic(
        &self,
        prefilled_ptrs: &[DevicePtr],
        prefilled_sizes: &[usize],
    ) -> Result<()> {
        ensure_graph!(
            self.has_compared_against_recapture,
            Precondition,
            "replay_dynamic requires compare_with_recapture against a distinct-sentinel recapture"
        );
        ensure_graph!(
            self.has_graph_exec,
            Precondition,
            "replay_dynamic called without a preceding successful capture"
        );
        ensure_graph!(
            prefilled_ptrs.len() == prefilled_sizes.len(),
            Precondition,
            "{} prefilled pointers but {} sizes",
            prefilled_ptrs.len(),
            prefilled_sizes.len()
        );
        ensure_graph!(
            prefilled_ptrs.len() <= self.allocation_sizes.len(),
            Precondition,
            "{} prefilled buffers for a graph that made {} allocations",
            prefilled_ptrs.len(),
            self.allocation_sizes.len()
        );
        for (index, (&given, &recorded)) in prefilled_sizes.iter().zip(&self.allocation_sizes).enumerate() {
            ensure_graph!(
                given == recorded,
                Precondition,
                "prefilled buffer {index} is {given} bytes but the capture allocated {recorded}"
            );
        }

        let driver = self.ctx.driver();
        let _guard = DeviceGuard::new(driver.as_ref(), self.capture_device())?;
        let stream = driver.current_stream();
        let exec = self.exec_raw()?;

        let mut plan = ReplayBufferPlan::new(
            self.ctx.allocator().as_ref(),
            &self.allocation_sizes,
            prefilled_ptrs,
            stream,
        )?;

        for update in &self.graph_node_param_updates {
            let params = update.patch.compute(plan.actual());
            driver.exec_set_node_params(exec, update.node, &params)?;
        }

        self.generators.replay_prologue();

        if self.kernel_param_updates.is_empty() {
            driver.graph_upload(exec, stream)?;
        } else {
            let records: Vec<KernelNodeUpdate> = self
                .kernel_param_updates
                .iter()
                .map(|update| update.record(plan.actual()))
                .collect();
            let host = KernelNodeUpdate::encode(&records);
            let device = plan.scratch(host.len(), stream)?;
            // SAFETY: `host` moves into the callback below, which the driver runs
            // only after the copy has drained; moving a Vec keeps its heap buffer.
            unsafe { driver.memcpy_htod_async(device, host.as_ptr(), host.len(), stream)? };
            driver.launch_host_func(stream, Box::new(move || drop(host)))?;

            driver.graph_upload(exec, stream)?;
            driver.launch_graph_updater(device, records.len(), stream)?;
        }

        driver.graph_launch(exec, stream)?;
        tracing::trace!(
            kernel_updates = self.kernel_param_updates.len(),
            node_updates = self.graph_node_param_updates.len(),
            "dynamic replay launched"
        );
        Ok(())
    }

    /// [`replay_dynamic`](Self::replay_dynamic) over a struct of named buffers.
    pub fn replay_dynamic_with<P: PrefilledBuffers + ?Sized>(&self, buffers: &P) -> Result<()> {
        let (ptrs, sizes): (Vec<_>, Vec<_>) = buffers.prefilled().into_iter().unzip();
        self.replay_dynamic(&ptrs, &sizes)
    }
}

/// Capture `program` in both sentinel modes and diff the captures, returning
/// a graph ready for [`GraphHandle::replay_dynamic`].
///
/// `program` runs twice on the current stream and must make the same
/// allocations in the same order both times.
pub fn build_dynamic<D, F>(ctx: &Arc<GraphContext<D>>, mut program: F) -> Result<GraphHandle<D>>
where
    D: Driver,
    F: FnMut() -> Result<()>,
{
    let mut shared = GraphHandle::new(Arc::clone(ctx));
    shared.capture(
        MempoolId::default(),
        CaptureMode::Global,
        SentinelMode::Shared,
        &mut program,
    )?;
    let mut distinct = GraphHandle::new(Arc::clone(ctx));
    distinct.capture(
        MempoolId::default(),
        CaptureMode::Global,
        SentinelMode::Distinct,
        &mut program,
    )?;
    shared.compare_with_recapture(&distinct)?;
    Ok(shared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{allocator::HookedAllocator, sim::SimDriver};

    #[test]
    fn plan_frees_only_ephemeral_buffers() -> Result<()> {
        let driver = Arc::new(SimDriver::new());
        let stream = driver.create_stream();
        let allocator = HookedAllocator::new(Arc::clone(&driver));
        let input = allocator.raw_alloc_with_stream(16, stream)?;
        {
            let mut plan = ReplayBufferPlan::new(&allocator, &[16, 32, 64], &[input], stream)?;
            assert_eq!(plan.actual().len(), 3);
            assert_eq!(plan.actual()[0], input);
            plan.scratch(40, stream)?;
            assert_eq!(allocator.stats().live_blocks, 4);
        }
        assert_eq!(allocator.stats().live_blocks, 1);
        allocator.raw_delete(input)
    }

    #[test]
    fn plan_cleans_up_after_allocation_failure() -> Result<()> {
        let driver = Arc::new(SimDriver::new());
        let stream = driver.create_stream();
        let allocator = HookedAllocator::new(Arc::clone(&driver));
        driver.set_memory_limit(Some(100));
        assert!(ReplayBufferPlan::new(&allocator, &[8, 64, 64], &[], stream).is_err());
        assert_eq!(driver.live_allocations(), 0);
        Ok(())
    }

    #[test]
    fn slices_are_prefilled_buffers() {
        let buffers = [(0x1000u64, 16usize), (0x2000, 32)];
        assert_eq!(buffers[..].prefilled(), vec![(0x1000, 16), (0x2000, 32)]);
    }
}
