use std::{
    path::Path,
    process::Command,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};

use crate::{
    allocator::{MempoolId, StreamFilter},
    context::GraphContext,
    diff::{GraphNodeParamUpdate, KernelParamUpdate},
    driver::{
        CaptureMode, CaptureStatus, DeviceGuard, DeviceIndex, Driver, InstantiateFlags,
        AUTO_FREE_ON_LAUNCH_MIN_VERSION,
    },
    error::{ensure_graph, GraphError},
    recorder::AllocationRecorder,
    rng::{CapturedGenerators, GraphSafeGenerator},
    sentinel::SentinelMode,
};

pub enum GraphDumpFormat {
    Svg,
    Png,
    Dot,
}

pub enum GraphDumpVerbosity {
    Clean,
    Verbose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Uncaptured,
    Capturing,
    /// Captured but not instantiated; sentinel captures stay here until diffed.
    Captured,
    Instantiated,
    /// Instantiated with patch lists from `compare_with_recapture`.
    DynamicallyReady,
}

/// Owned driver graph, destroyed on drop.
pub(crate) struct DriverGraph<D: Driver> {
    driver: Arc<D>,
    raw: Option<D::Graph>,
}

impl<D: Driver> DriverGraph<D> {
    fn new(driver: Arc<D>, raw: D::Graph) -> Self {
        Self {
            driver,
            raw: Some(raw),
        }
    }

    pub(crate) fn raw(&self) -> Result<D::Graph> {
        self.raw
            .ok_or_else(|| GraphError::misuse("driver graph already destroyed").into())
    }

    fn destroy(mut self) -> Result<()> {
        match self.raw.take() {
            Some(raw) => self.driver.graph_destroy(raw),
            None => Ok(()),
        }
    }
}

impl<D: Driver> Drop for DriverGraph<D> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            if let Err(e) = self.driver.graph_destroy(raw) {
                tracing::warn!("failed to destroy graph {raw:?}: {e}");
            }
        }
    }
}

/// Owned instantiated graph, destroyed on drop.
pub(crate) struct DriverGraphExec<D: Driver> {
    driver: Arc<D>,
    raw: Option<D::GraphExec>,
}

impl<D: Driver> DriverGraphExec<D> {
    fn new(driver: Arc<D>, raw: D::GraphExec) -> Self {
        Self {
            driver,
            raw: Some(raw),
        }
    }

    pub(crate) fn raw(&self) -> Result<D::GraphExec> {
        self.raw
            .ok_or_else(|| GraphError::misuse("graph exec already destroyed").into())
    }

    fn destroy(mut self) -> Result<()> {
        match self.raw.take() {
            Some(raw) => self.driver.graph_exec_destroy(raw),
            None => Ok(()),
        }
    }
}

impl<D: Driver> Drop for DriverGraphExec<D> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            if let Err(e) = self.driver.graph_exec_destroy(raw) {
                tracing::warn!("failed to destroy graph exec {raw:?}: {e}");
            }
        }
    }
}

/// A captured CUDA graph.
///
/// Capture work enqueued on the current (non-default) stream between
/// [`capture_begin`](Self::capture_begin) and [`capture_end`](Self::capture_end),
/// then [`replay`](Self::replay) it. Sentinel captures are instead diffed with
/// [`compare_with_recapture`](Self::compare_with_recapture) and replayed
/// against fresh buffers with [`replay_dynamic`](Self::replay_dynamic).
pub struct GraphHandle<D: Driver> {
    pub(crate) ctx: Arc<GraphContext<D>>,
    pub(crate) graph: Option<DriverGraph<D>>,
    pub(crate) exec: Option<DriverGraphExec<D>>,
    pub(crate) has_graph: bool,
    pub(crate) has_graph_exec: bool,
    capturing: bool,
    pool_registered: bool,
    capture_stream: Option<D::Stream>,
    capture_device: DeviceIndex,
    mempool_id: MempoolId,
    pub(crate) generators: CapturedGenerators,
    /// Set between the generators' capture prologue and epilogue.
    generators_capturing: bool,
    pub(crate) sentinel_mode: SentinelMode,
    sentinel_token: Option<u64>,
    recorder: AllocationRecorder,
    pub(crate) allocation_sizes: Vec<usize>,
    pub(crate) kernel_param_updates: Vec<KernelParamUpdate>,
    pub(crate) graph_node_param_updates: Vec<GraphNodeParamUpdate<D::Node>>,
    pub(crate) has_compared_against_recapture: bool,
}

impl<D: Driver> GraphHandle<D> {
    pub fn new(ctx: Arc<GraphContext<D>>) -> Self {
        Self {
            ctx,
            graph: None,
            exec: None,
            has_graph: false,
            has_graph_exec: false,
            capturing: false,
            pool_registered: false,
            capture_stream: None,
            capture_device: 0,
            mempool_id: MempoolId::default(),
            generators: CapturedGenerators::default(),
            generators_capturing: false,
            sentinel_mode: SentinelMode::Off,
            sentinel_token: None,
            recorder: AllocationRecorder::new(),
            allocation_sizes: Vec::new(),
            kernel_param_updates: Vec::new(),
            graph_node_param_updates: Vec::new(),
            has_compared_against_recapture: false,
        }
    }

    pub fn context(&self) -> &Arc<GraphContext<D>> {
        &self.ctx
    }

    /// Track `generator` in addition to the default generator. Must be called
    /// before `capture_begin`.
    pub fn register_generator_state(&mut self, generator: Arc<dyn GraphSafeGenerator>) {
        self.generators.register(generator);
    }

    /// Start capturing work on the current stream.
    ///
    /// `pool` shares a mempool with other graphs (see
    /// [`GraphContext::graph_pool_handle`]); pass `MempoolId::default()` for a
    /// private pool.
    pub fn capture_begin(
        &mut self,
        pool: MempoolId,
        mode: CaptureMode,
        sentinel: SentinelMode,
    ) -> Result<()> {
        ensure_graph!(
            !self.has_graph_exec,
            Misuse,
            "this graph has already been instantiated; reset() it before capturing again"
        );
        ensure_graph!(
            !self.capturing && !self.has_graph,
            Misuse,
            "this graph already holds a capture; reset() it before capturing again"
        );
        ensure_graph!(
            pool.0 == 0 || pool.1 == 0,
            Misuse,
            "pool id {pool:?} must have exactly one non-zero half"
        );

        let driver = Arc::clone(self.ctx.driver());
        let stream = driver.current_stream();
        ensure_graph!(
            stream != driver.default_stream(),
            Misuse,
            "CUDA graphs must be captured on a non-default stream"
        );

        let device = driver.current_device()?;
        self.capture_stream = Some(stream);
        self.capture_device = device;

        self.mempool_id = if pool.is_unset() {
            self.ctx.private_pool()
        } else {
            pool
        };

        // A fresh id cell so that filters from earlier captures never match.
        let capture_id = Arc::new(AtomicU64::new(0));
        let filter: StreamFilter<D::Stream> = {
            let driver = Arc::clone(&driver);
            let capture_id = Arc::clone(&capture_id);
            Arc::new(move |stream| match driver.stream_capture_info(stream) {
                Ok((status, id)) => {
                    status == CaptureStatus::Active && id == capture_id.load(Ordering::Acquire)
                }
                Err(e) => {
                    tracing::warn!("querying capture info of {stream:?} for pool routing: {e}");
                    false
                }
            })
        };

        let allocator = self.ctx.allocator();
        allocator.begin_allocate_to_pool(device, self.mempool_id, Arc::clone(&filter));
        self.pool_registered = true;

        self.sentinel_mode = sentinel;
        if sentinel.is_active() {
            let token = self.ctx.next_capture_token();
            self.recorder.reset();
            let fake = self
                .recorder
                .fake_allocator(sentinel, self.ctx.config().sentinel);
            allocator.begin_allocate_sentinel_pointers(device, filter, fake, token);
            self.sentinel_token = Some(token);
        }

        self.wait_for_event_queries();

        self.generators
            .register(self.ctx.generators().default_generator());
        self.generators.capture_prologue();
        self.generators_capturing = true;

        if let Err(e) = driver.stream_begin_capture(stream, mode) {
            self.end_sessions();
            self.finish_generator_capture();
            return Err(e);
        }
        self.capturing = true;

        let (status, id) = driver.stream_capture_info(stream)?;
        ensure_graph!(
            status == CaptureStatus::Active,
            Misuse,
            "stream {stream:?} is not capturing after capture begin ({status:?})"
        );
        capture_id.store(id, Ordering::Release);
        tracing::debug!(
            capture_id = id,
            ?stream,
            ?sentinel,
            pool = ?self.mempool_id,
            generators = self.generators.len(),
            "capture started"
        );
        Ok(())
    }

    fn wait_for_event_queries(&self) {
        let mut warned = false;
        while self.ctx.num_pending_event_queries() > 0 {
            if !warned {
                tracing::warn!(
                    pending = self.ctx.num_pending_event_queries(),
                    "waiting for pending event queries to finish before starting capture"
                );
                warned = true;
            }
            std::thread::sleep(self.ctx.config().event_query_poll);
        }
    }

    /// Take the generators out of capture mode, recording their increments.
    fn finish_generator_capture(&mut self) {
        if self.generators_capturing {
            self.generators.capture_epilogue();
            self.generators_capturing = false;
        }
    }

    fn end_sessions(&mut self) {
        let allocator = self.ctx.allocator();
        allocator.end_allocate_to_pool(self.capture_device, self.mempool_id);
        if let Some(token) = self.sentinel_token.take() {
            allocator.end_allocate_sentinel_pointers(token);
        }
    }

    /// Finish the capture. Non-sentinel graphs are instantiated right away.
    pub fn capture_end(&mut self) -> Result<()> {
        ensure_graph!(
            self.capturing,
            Misuse,
            "capture_end called without a matching capture_begin"
        );
        let driver = Arc::clone(self.ctx.driver());
        let stream = driver.current_stream();
        ensure_graph!(
            Some(stream) == self.capture_stream,
            Misuse,
            "capture must end on the same stream it began on"
        );

        let ended = driver.stream_end_capture(stream);
        self.capturing = false;
        self.end_sessions();
        let graph = match ended {
            Ok(graph) => graph,
            Err(e) => {
                self.finish_generator_capture();
                return Err(e.context("ending stream capture"));
            }
        };

        self.graph = Some(DriverGraph::new(driver, graph));
        self.has_graph = true;
        self.allocation_sizes = self.recorder.sizes();

        if self.sentinel_mode.is_active() {
            tracing::debug!(
                allocations = self.allocation_sizes.len(),
                mode = ?self.sentinel_mode,
                "sentinel capture finished"
            );
            return Ok(());
        }
        self.instantiate()
    }

    /// Begin, run `body`, end. If `body` fails the capture is aborted and the
    /// handle reset before the error is returned.
    pub fn capture<F>(
        &mut self,
        pool: MempoolId,
        mode: CaptureMode,
        sentinel: SentinelMode,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        self.capture_begin(pool, mode, sentinel)?;
        if let Err(e) = body() {
            self.reset();
            return Err(e);
        }
        self.capture_end()
    }

    pub fn instantiate(&mut self) -> Result<()> {
        ensure_graph!(
            self.has_graph,
            Misuse,
            "instantiate requires a finished capture"
        );
        ensure_graph!(
            !self.has_graph_exec,
            Misuse,
            "this graph has already been instantiated"
        );
        let driver = Arc::clone(self.ctx.driver());
        let raw = self.graph_raw()?;

        let instantiated = driver.driver_version().and_then(|version| {
            let flags = InstantiateFlags {
                auto_free_on_launch: version >= AUTO_FREE_ON_LAUNCH_MIN_VERSION,
            };
            driver.instantiate(raw, flags)
        });
        self.finish_generator_capture();
        self.exec = Some(DriverGraphExec::new(Arc::clone(&driver), instantiated?));

        if driver.graph_nodes(raw)?.is_empty() {
            tracing::warn!(
                "the captured graph has no nodes; was the work enqueued on the capture stream?"
            );
        }

        if !self.ctx.debug_mode() && !self.retains_graph_for_patches() {
            if let Some(graph) = self.graph.take() {
                if let Err(e) = graph.destroy() {
                    tracing::warn!("failed to release captured graph after instantiation: {e}");
                }
            }
            self.has_graph = false;
        }

        self.has_graph_exec = true;
        Ok(())
    }

    /// Launch the instantiated graph on the current stream.
    pub fn replay(&self) -> Result<()> {
        ensure_graph!(
            self.has_graph_exec,
            Misuse,
            "replay called without a preceding successful capture"
        );
        ensure_graph!(
            !self.sentinel_mode.is_active(),
            Misuse,
            "sentinel graphs hold placeholder pointers; use replay_dynamic"
        );
        let driver = self.ctx.driver();
        let _guard = DeviceGuard::new(driver.as_ref(), self.capture_device)?;

        self.generators.replay_prologue();
        let exec = self.exec_raw()?;
        driver.graph_launch(exec, driver.current_stream())?;

        if driver.driver_version()? < AUTO_FREE_ON_LAUNCH_MIN_VERSION {
            // Older drivers can corrupt back to back replays.
            driver.device_synchronize()?;
        }
        Ok(())
    }

    pub(crate) fn graph_raw(&self) -> Result<D::Graph> {
        self.graph
            .as_ref()
            .ok_or_else(|| GraphError::misuse("graph holds no captured graph"))?
            .raw()
    }

    pub(crate) fn exec_raw(&self) -> Result<D::GraphExec> {
        self.exec
            .as_ref()
            .ok_or_else(|| GraphError::misuse("graph has no exec"))?
            .raw()
    }

    /// Requires that you have installed the [graphviz](https://graphviz.org/download/) library
    /// for the `Png` and `Svg` formats. Writes the retained graph to `out`.
    pub fn debug_dump<P: AsRef<Path>>(
        &mut self,
        out: P,
        format: GraphDumpFormat,
        verbosity: GraphDumpVerbosity,
    ) -> Result<()> {
        if !self.ctx.debug_mode() {
            tracing::warn!(
                "debug_dump has no effect unless enable_debug_mode() is called before instantiation"
            );
            return Ok(());
        }
        let raw = self
            .graph
            .as_ref()
            .ok_or_else(|| GraphError::misuse("no captured graph is retained for dumping"))?
            .raw()?;

        let tmp = if let GraphDumpFormat::Dot = format {
            out.as_ref().to_path_buf()
        } else {
            std::env::temp_dir().join("cuda-graph-dump.dot")
        };
        let verbose = matches!(verbosity, GraphDumpVerbosity::Verbose);
        self.ctx.driver().debug_dot_print(raw, &tmp, verbose)?;

        let renderer = match format {
            GraphDumpFormat::Png => Some("-Tpng"),
            GraphDumpFormat::Svg => Some("-Tsvg"),
            GraphDumpFormat::Dot => None,
        };
        if let Some(flag) = renderer {
            let output = Command::new("dot")
                .arg(flag)
                .arg(&tmp)
                .output()
                .context("running graphviz `dot`")?;
            anyhow::ensure!(
                output.status.success(),
                "graphviz `dot` failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
            std::fs::write(out, output.stdout)?;
        }

        if self.has_graph_exec && !self.retains_graph_for_patches() {
            if let Some(graph) = self.graph.take() {
                graph.destroy()?;
            }
            self.has_graph = false;
        }
        Ok(())
    }

    /// Host-side node patches address nodes of the captured graph, so it has
    /// to outlive the exec.
    fn retains_graph_for_patches(&self) -> bool {
        !self.graph_node_param_updates.is_empty()
    }

    /// Release the driver graph, exec and mempool. Safe to call repeatedly.
    pub fn reset(&mut self) {
        if self.capturing {
            self.abort_capture();
        }
        if self.pool_registered {
            if let Err(e) = self
                .ctx
                .allocator()
                .release_pool(self.capture_device, self.mempool_id)
            {
                tracing::warn!("failed to release mempool {:?}: {e}", self.mempool_id);
            }
            self.pool_registered = false;
        }
        if let Some(graph) = self.graph.take() {
            if let Err(e) = graph.destroy() {
                tracing::warn!("failed to destroy captured graph: {e}");
            }
        }
        if let Some(exec) = self.exec.take() {
            if let Err(e) = exec.destroy() {
                tracing::warn!("failed to destroy graph exec: {e}");
            }
        }
        self.finish_generator_capture();
        self.has_graph = false;
        self.has_graph_exec = false;
        self.has_compared_against_recapture = false;
        self.allocation_sizes.clear();
        self.kernel_param_updates.clear();
        self.graph_node_param_updates.clear();
    }

    fn abort_capture(&mut self) {
        let driver = Arc::clone(self.ctx.driver());
        if let Some(stream) = self.capture_stream {
            match driver.stream_end_capture(stream) {
                Ok(graph) => drop(DriverGraph::new(Arc::clone(&driver), graph)),
                Err(e) => tracing::warn!("failed to abort capture on {stream:?}: {e}"),
            }
        }
        self.capturing = false;
        self.end_sessions();
        self.finish_generator_capture();
    }

    /// The mempool this graph allocated from, for sharing with another capture.
    pub fn pool(&self) -> Result<MempoolId> {
        ensure_graph!(
            self.has_graph_exec,
            Misuse,
            "pool() called without a preceding successful capture"
        );
        Ok(self.mempool_id)
    }

    pub fn state(&self) -> GraphState {
        if self.capturing {
            GraphState::Capturing
        } else if self.has_graph_exec && self.has_compared_against_recapture {
            GraphState::DynamicallyReady
        } else if self.has_graph_exec {
            GraphState::Instantiated
        } else if self.has_graph {
            GraphState::Captured
        } else {
            GraphState::Uncaptured
        }
    }

    pub fn has_graph(&self) -> bool {
        self.has_graph
    }

    pub fn has_graph_exec(&self) -> bool {
        self.has_graph_exec
    }

    pub fn sentinel_mode(&self) -> SentinelMode {
        self.sentinel_mode
    }

    pub fn capture_stream(&self) -> Option<D::Stream> {
        self.capture_stream
    }

    pub fn capture_device(&self) -> DeviceIndex {
        self.capture_device
    }

    /// Byte sizes of the allocations made during a sentinel capture, in order.
    pub fn allocation_sizes(&self) -> &[usize] {
        &self.allocation_sizes
    }

    pub fn kernel_param_updates(&self) -> &[KernelParamUpdate] {
        &self.kernel_param_updates
    }

    pub fn graph_node_param_updates(&self) -> &[GraphNodeParamUpdate<D::Node>] {
        &self.graph_node_param_updates
    }
}

impl<D: Driver> Drop for GraphHandle<D> {
    fn drop(&mut self) {
        self.reset();
    }
}
