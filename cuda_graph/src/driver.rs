//! The seam between the engine and the CUDA driver.
//!
//! Everything the capture, diff and replay code needs from the driver goes
//! through [`Driver`]. The raw handle types are associated types so that the
//! real driver can use `CUgraph`/`CUstream` directly while the simulated
//! driver uses plain ids.

use std::{fmt, path::Path};

use anyhow::Result;

pub type DevicePtr = u64;
pub type DeviceIndex = i32;
pub type CaptureId = u64;

/// Driver version at which `AUTO_FREE_ON_LAUNCH` exists and back to back
/// replays no longer need a device synchronize.
pub const AUTO_FREE_ON_LAUNCH_MIN_VERSION: i32 = 11040;

/// `cudaStreamCaptureMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    /// Forbids potentially unsafe API calls from any thread during capture.
    #[default]
    Global,
    ThreadLocal,
    Relaxed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    None,
    Active,
    Invalidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Kernel,
    Memcpy,
    Memset,
    Host,
    Graph,
    Empty,
    WaitEvent,
    EventRecord,
    ExtSemaphoreSignal,
    ExtSemaphoreWait,
    MemAlloc,
    MemFree,
    BatchMemOp,
    Conditional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstantiateFlags {
    pub auto_free_on_launch: bool,
}

/// Opaque device-side handle of a device-updatable kernel node.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceNode(pub u64);

impl DeviceNode {
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// One kernel argument as it sits in the kernel's parameter block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelParam {
    /// Byte offset of the argument inside the parameter block.
    pub offset: usize,
    pub bytes: Vec<u8>,
}

impl KernelParam {
    /// The argument viewed as pointer-sized words, paired with their byte
    /// offset inside the argument. Trailing bytes that do not fill a word are
    /// not visited.
    pub fn words(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.bytes
            .chunks_exact(WORD)
            .enumerate()
            .map(|(i, chunk)| {
                let mut word = [0u8; WORD];
                word.copy_from_slice(chunk);
                (i * WORD, u64::from_ne_bytes(word))
            })
    }
}

const WORD: usize = std::mem::size_of::<u64>();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelNodeParams {
    /// Identity of the launched function; equal across captures of the same program.
    pub func: u64,
    pub name: String,
    pub params: Vec<KernelParam>,
}

impl KernelNodeParams {
    /// Size of the whole parameter block.
    pub fn block_size(&self) -> usize {
        self.params
            .iter()
            .map(|p| p.offset + p.bytes.len())
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PitchedPtr {
    pub ptr: DevicePtr,
    pub pitch: usize,
    pub xsize: usize,
    pub ysize: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pos3 {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent3 {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemcpyKind {
    HostToHost,
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
    Default,
}

/// `cudaMemcpy3DParms` restricted to pitched pointers; array operands are
/// never produced by tensor code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemcpyParams {
    pub src: PitchedPtr,
    pub src_pos: Pos3,
    pub dst: PitchedPtr,
    pub dst_pos: Pos3,
    pub extent: Extent3,
    pub kind: MemcpyKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemsetParams {
    pub dst: DevicePtr,
    pub pitch: usize,
    pub value: u32,
    pub element_size: u32,
    pub width: usize,
    pub height: usize,
}

/// Parameters accepted by the host-side exec-node update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeParams {
    Memcpy(MemcpyParams),
    Memset(MemsetParams),
}

/// `cudaGraphKernelNodeFieldParam`.
pub const KERNEL_NODE_FIELD_PARAM: u32 = 2;

/// Host mirror of `cudaGraphKernelNodeUpdate` for a parameter update.
///
/// `value` carries the new pointer itself; the device-side updater stores it
/// in device memory and points the driver's `pValue` at that copy.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelNodeUpdate {
    pub node: DeviceNode,
    pub field: u32,
    _pad: u32,
    pub value: u64,
    pub offset: u64,
    pub size: u64,
}

impl KernelNodeUpdate {
    pub const SIZE: usize = 40;

    pub fn param(node: DeviceNode, offset: usize, value: DevicePtr) -> Self {
        Self {
            node,
            field: KERNEL_NODE_FIELD_PARAM,
            _pad: 0,
            value,
            offset: offset as u64,
            size: std::mem::size_of::<DevicePtr>() as u64,
        }
    }

    pub fn encode(updates: &[Self]) -> Vec<u8> {
        let mut out = Vec::with_capacity(updates.len() * Self::SIZE);
        for u in updates {
            out.extend_from_slice(&u.node.0.to_ne_bytes());
            out.extend_from_slice(&u.field.to_ne_bytes());
            out.extend_from_slice(&0u32.to_ne_bytes());
            out.extend_from_slice(&u.value.to_ne_bytes());
            out.extend_from_slice(&u.offset.to_ne_bytes());
            out.extend_from_slice(&u.size.to_ne_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Vec<Self> {
        let u64_at = |c: &[u8], at: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&c[at..at + 8]);
            u64::from_ne_bytes(w)
        };
        bytes
            .chunks_exact(Self::SIZE)
            .map(|c| {
                let mut field = [0u8; 4];
                field.copy_from_slice(&c[8..12]);
                Self {
                    node: DeviceNode(u64_at(c, 0)),
                    field: u32::from_ne_bytes(field),
                    _pad: 0,
                    value: u64_at(c, 16),
                    offset: u64_at(c, 24),
                    size: u64_at(c, 32),
                }
            })
            .collect()
    }
}

/// CUDA driver operations used by the engine.
pub trait Driver: Send + Sync + 'static {
    type Stream: Copy + Eq + fmt::Debug + Send + Sync + 'static;
    type Graph: Copy + fmt::Debug + Send + Sync + 'static;
    type GraphExec: Copy + fmt::Debug + Send + Sync + 'static;
    type Node: Copy + Eq + fmt::Debug + Send + Sync + 'static;

    fn current_device(&self) -> Result<DeviceIndex>;
    fn set_current_device(&self, device: DeviceIndex) -> Result<()>;
    /// The stream framework work is currently enqueued on.
    fn current_stream(&self) -> Self::Stream;
    fn default_stream(&self) -> Self::Stream;
    fn stream_device(&self, stream: Self::Stream) -> Result<DeviceIndex>;
    fn driver_version(&self) -> Result<i32>;
    fn device_synchronize(&self) -> Result<()>;

    fn stream_begin_capture(&self, stream: Self::Stream, mode: CaptureMode) -> Result<()>;
    fn stream_capture_info(&self, stream: Self::Stream) -> Result<(CaptureStatus, CaptureId)>;
    fn stream_end_capture(&self, stream: Self::Stream) -> Result<Self::Graph>;

    fn graph_nodes(&self, graph: Self::Graph) -> Result<Vec<Self::Node>>;
    fn node_kind(&self, node: Self::Node) -> Result<NodeKind>;
    fn kernel_node_params(&self, node: Self::Node) -> Result<KernelNodeParams>;
    fn memcpy_node_params(&self, node: Self::Node) -> Result<MemcpyParams>;
    fn memset_node_params(&self, node: Self::Node) -> Result<MemsetParams>;
    /// Mark a kernel node device-updatable. Must happen before instantiation.
    fn set_device_updatable(&self, node: Self::Node) -> Result<DeviceNode>;

    fn instantiate(&self, graph: Self::Graph, flags: InstantiateFlags) -> Result<Self::GraphExec>;
    fn graph_launch(&self, exec: Self::GraphExec, stream: Self::Stream) -> Result<()>;
    fn graph_upload(&self, exec: Self::GraphExec, stream: Self::Stream) -> Result<()>;
    fn exec_set_node_params(
        &self,
        exec: Self::GraphExec,
        node: Self::Node,
        params: &NodeParams,
    ) -> Result<()>;
    fn graph_destroy(&self, graph: Self::Graph) -> Result<()>;
    fn graph_exec_destroy(&self, exec: Self::GraphExec) -> Result<()>;
    fn debug_dot_print(&self, graph: Self::Graph, path: &Path, verbose: bool) -> Result<()>;

    fn mem_alloc(&self, size: usize, stream: Self::Stream) -> Result<DevicePtr>;
    fn mem_free(&self, ptr: DevicePtr) -> Result<()>;
    /// # Safety
    /// `src` must stay valid for `len` bytes until the copy has drained on `stream`.
    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        len: usize,
        stream: Self::Stream,
    ) -> Result<()>;
    /// Run `f` on a driver thread once all prior work on `stream` has completed.
    fn launch_host_func(&self, stream: Self::Stream, f: Box<dyn FnOnce() + Send>) -> Result<()>;
    /// Launch the device-side rewriter over `count` [`KernelNodeUpdate`] records at `updates`.
    fn launch_graph_updater(
        &self,
        updates: DevicePtr,
        count: usize,
        stream: Self::Stream,
    ) -> Result<()>;
}

/// Restores the previously current device on drop.
pub struct DeviceGuard<'a, D: Driver> {
    driver: &'a D,
    previous: Option<DeviceIndex>,
}

impl<'a, D: Driver> DeviceGuard<'a, D> {
    pub fn new(driver: &'a D, device: DeviceIndex) -> Result<Self> {
        let current = driver.current_device()?;
        if current == device {
            return Ok(Self {
                driver,
                previous: None,
            });
        }
        driver.set_current_device(device)?;
        Ok(Self {
            driver,
            previous: Some(current),
        })
    }
}

impl<D: Driver> Drop for DeviceGuard<'_, D> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous {
            if let Err(e) = self.driver.set_current_device(previous) {
                tracing::warn!("failed to restore device {previous}: {e}");
            }
        }
    }
}
