//! An in-process emulation of the CUDA driver.
//!
//! Device memory is host memory at fake device addresses, every stream runs
//! its work synchronously at enqueue time, and kernels are Rust closures
//! registered by name. Stream capture, graph introspection, instantiation,
//! device-updatable kernel nodes and the device-side updater behave like the
//! driver's, which makes the whole capture/diff/replay pipeline testable
//! without a GPU. Dereferencing an address that is not mapped (for instance a
//! sentinel pointer that was never patched) fails the launch.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::Write as _,
    path::Path,
    sync::Arc,
};

use anyhow::{anyhow, bail, ensure, Context, Result};
use parking_lot::Mutex;

use crate::driver::{
    CaptureId, CaptureMode, CaptureStatus, DeviceIndex, DeviceNode, DevicePtr, Driver, Extent3,
    InstantiateFlags, KernelNodeParams, KernelNodeUpdate, KernelParam, MemcpyKind, MemcpyParams,
    MemsetParams, NodeKind, NodeParams, PitchedPtr, Pos3, KERNEL_NODE_FIELD_PARAM,
};

/// Kernel body: device memory plus one byte slice per argument.
pub type KernelBody = Arc<dyn Fn(&mut SimMemory, &[&[u8]]) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimStream(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimGraph(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimGraphExec(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimNode(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimFunction(u64);

/// Driver calls that can be made to fail once, for error-path tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CaptureInfo,
    EndCapture,
    Instantiate,
    GraphDestroy,
    GraphExecDestroy,
    GraphLaunch,
}

const DEVICE_COUNT: DeviceIndex = 2;
const MEMORY_BASE: DevicePtr = 0x7f00_0000_0000;
const ALLOC_ALIGN: DevicePtr = 256;
const DEVICE_NODE_BASE: u64 = 0xd000_0000;

pub fn ptr_arg(ptr: DevicePtr) -> Vec<u8> {
    ptr.to_ne_bytes().to_vec()
}

pub fn f32_arg(value: f32) -> Vec<u8> {
    value.to_ne_bytes().to_vec()
}

pub fn u32_arg(value: u32) -> Vec<u8> {
    value.to_ne_bytes().to_vec()
}

pub fn read_ptr(arg: &[u8]) -> Result<DevicePtr> {
    Ok(DevicePtr::from_ne_bytes(arg.try_into().context("pointer argument")?))
}

pub fn read_f32(arg: &[u8]) -> Result<f32> {
    Ok(f32::from_ne_bytes(arg.try_into().context("f32 argument")?))
}

pub fn read_u32(arg: &[u8]) -> Result<u32> {
    Ok(u32::from_ne_bytes(arg.try_into().context("u32 argument")?))
}

/// Emulated device memory.
#[derive(Debug, Default)]
pub struct SimMemory {
    allocations: BTreeMap<DevicePtr, Vec<u8>>,
    next: DevicePtr,
    limit: Option<usize>,
}

impl SimMemory {
    fn new() -> Self {
        Self {
            allocations: BTreeMap::new(),
            next: MEMORY_BASE,
            limit: None,
        }
    }

    fn used(&self) -> usize {
        self.allocations.values().map(Vec::len).sum()
    }

    fn alloc(&mut self, size: usize) -> Result<DevicePtr> {
        if let Some(limit) = self.limit {
            ensure!(
                self.used() + size <= limit,
                "out of memory allocating {size} bytes"
            );
        }
        let ptr = self.next;
        let span = (size.max(1) as DevicePtr).next_multiple_of(ALLOC_ALIGN);
        // Leave an unmapped gap so overruns are caught.
        self.next += span + ALLOC_ALIGN;
        self.allocations.insert(ptr, vec![0; size]);
        Ok(ptr)
    }

    fn free(&mut self, ptr: DevicePtr) -> Result<()> {
        self.allocations
            .remove(&ptr)
            .map(|_| ())
            .ok_or_else(|| anyhow!("invalid device pointer {ptr:#x} passed to free"))
    }

    fn locate(&self, ptr: DevicePtr, len: usize) -> Result<(DevicePtr, usize)> {
        let (&base, data) = self
            .allocations
            .range(..=ptr)
            .next_back()
            .ok_or_else(|| anyhow!("illegal address {ptr:#x}"))?;
        let start = (ptr - base) as usize;
        ensure!(
            start + len <= data.len(),
            "illegal address {ptr:#x}: {len} bytes overrun the allocation at {base:#x}"
        );
        Ok((base, start))
    }

    pub fn read(&self, ptr: DevicePtr, len: usize) -> Result<&[u8]> {
        let (base, start) = self.locate(ptr, len)?;
        Ok(&self.allocations[&base][start..start + len])
    }

    pub fn write(&mut self, ptr: DevicePtr, bytes: &[u8]) -> Result<()> {
        let (base, start) = self.locate(ptr, bytes.len())?;
        let data = self
            .allocations
            .get_mut(&base)
            .ok_or_else(|| anyhow!("illegal address {ptr:#x}"))?;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_f32s(&self, ptr: DevicePtr, n: usize) -> Result<Vec<f32>> {
        let bytes = self.read(ptr, n * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn write_f32s(&mut self, ptr: DevicePtr, values: &[f32]) -> Result<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        self.write(ptr, &bytes)
    }
}

struct KernelDef {
    name: String,
    offsets: Vec<usize>,
    sizes: Vec<usize>,
    body: KernelBody,
}

#[derive(Debug, Clone)]
enum Op {
    Kernel { func: u64, block: Vec<u8> },
    Memcpy(MemcpyParams),
    Memset(MemsetParams),
    Marker(NodeKind),
}

impl Op {
    fn kind(&self) -> NodeKind {
        match self {
            Self::Kernel { .. } => NodeKind::Kernel,
            Self::Memcpy(_) => NodeKind::Memcpy,
            Self::Memset(_) => NodeKind::Memset,
            Self::Marker(kind) => *kind,
        }
    }
}

struct NodeRecord {
    op: Op,
    device_node: Option<DeviceNode>,
}

struct StreamState {
    device: DeviceIndex,
    capture: Option<(CaptureId, SimGraph)>,
}

struct ExecState {
    nodes: Vec<(SimNode, Op)>,
    flags: InstantiateFlags,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCounters {
    pub graph_launches: usize,
    pub graph_uploads: usize,
    pub synchronizations: usize,
    pub node_param_sets: usize,
    pub updater_launches: usize,
    pub applied_kernel_updates: usize,
    pub host_callbacks: usize,
}

struct SimState {
    current_device: DeviceIndex,
    current_stream: SimStream,
    streams: HashMap<SimStream, StreamState>,
    graphs: HashMap<SimGraph, Vec<SimNode>>,
    nodes: HashMap<SimNode, NodeRecord>,
    execs: HashMap<SimGraphExec, ExecState>,
    device_nodes: HashMap<DeviceNode, (SimGraphExec, usize)>,
    kernels: Vec<KernelDef>,
    memory: SimMemory,
    counters: SimCounters,
    armed: HashSet<FailPoint>,
    next_stream: u32,
    next_graph: u32,
    next_exec: u32,
    next_node: u64,
    next_device_node: u64,
    next_capture_id: CaptureId,
}

impl SimState {
    fn stream(&self, stream: SimStream) -> Result<&StreamState> {
        self.streams
            .get(&stream)
            .ok_or_else(|| anyhow!("invalid stream {stream:?}"))
    }

    fn trip(&mut self, point: FailPoint) -> Result<()> {
        if self.armed.remove(&point) {
            bail!("injected failure at {point:?}");
        }
        Ok(())
    }

    fn enqueue(&mut self, stream: SimStream, op: Op) -> Result<()> {
        match self.stream(stream)?.capture {
            Some((_, graph)) => {
                let node = SimNode(self.next_node);
                self.next_node += 1;
                self.nodes.insert(
                    node,
                    NodeRecord {
                        op,
                        device_node: None,
                    },
                );
                self.graphs.entry(graph).or_default().push(node);
                Ok(())
            }
            None => self.run(&op),
        }
    }

    fn run(&mut self, op: &Op) -> Result<()> {
        let Self {
            kernels, memory, ..
        } = self;
        match op {
            Op::Kernel { func, block } => {
                let def = &kernels[*func as usize];
                let args: Vec<&[u8]> = def
                    .offsets
                    .iter()
                    .zip(&def.sizes)
                    .map(|(&offset, &size)| &block[offset..offset + size])
                    .collect();
                (def.body)(memory, &args).with_context(|| format!("kernel `{}` failed", def.name))
            }
            Op::Memcpy(p) => run_memcpy(memory, p),
            Op::Memset(p) => run_memset(memory, p),
            Op::Marker(_) => Ok(()),
        }
    }
}

fn run_memcpy(memory: &mut SimMemory, p: &MemcpyParams) -> Result<()> {
    ensure!(
        matches!(p.kind, MemcpyKind::DeviceToDevice | MemcpyKind::Default),
        "only device to device copies can be replayed, got {:?}",
        p.kind
    );
    let row = |ptr: &PitchedPtr, pos: &Pos3, y: usize, z: usize| {
        ptr.ptr
            + ((pos.z + z) * ptr.pitch * ptr.ysize + (pos.y + y) * ptr.pitch + pos.x) as DevicePtr
    };
    for z in 0..p.extent.depth {
        for y in 0..p.extent.height {
            let src = row(&p.src, &p.src_pos, y, z);
            let dst = row(&p.dst, &p.dst_pos, y, z);
            let bytes = memory.read(src, p.extent.width)?.to_vec();
            memory.write(dst, &bytes)?;
        }
    }
    Ok(())
}

fn run_memset(memory: &mut SimMemory, p: &MemsetParams) -> Result<()> {
    let element = match p.element_size {
        1 | 2 | 4 => &p.value.to_ne_bytes()[..p.element_size as usize],
        other => bail!("invalid memset element size {other}"),
    };
    let row: Vec<u8> = element.repeat(p.width);
    for y in 0..p.height {
        memory.write(p.dst + (y * p.pitch) as DevicePtr, &row)?;
    }
    Ok(())
}

fn param_layout(sizes: &[usize]) -> (Vec<usize>, usize) {
    let mut offsets = Vec::with_capacity(sizes.len());
    let mut end: usize = 0;
    for &size in sizes {
        let align = size.clamp(1, 8).next_power_of_two();
        let offset = end.next_multiple_of(align);
        offsets.push(offset);
        end = offset + size;
    }
    (offsets, end)
}

/// The emulated driver. Stream 0 is the default stream of device 0.
pub struct SimDriver {
    state: Mutex<SimState>,
    version: i32,
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDriver {
    pub fn new() -> Self {
        Self::with_version(12040)
    }

    /// Emulate a specific driver version (e.g. `11030` to exercise the
    /// pre-11.4 instantiate and replay paths).
    pub fn with_version(version: i32) -> Self {
        let mut streams = HashMap::new();
        streams.insert(
            SimStream(0),
            StreamState {
                device: 0,
                capture: None,
            },
        );
        Self {
            state: Mutex::new(SimState {
                current_device: 0,
                current_stream: SimStream(0),
                streams,
                graphs: HashMap::new(),
                nodes: HashMap::new(),
                execs: HashMap::new(),
                device_nodes: HashMap::new(),
                kernels: Vec::new(),
                memory: SimMemory::new(),
                counters: SimCounters::default(),
                armed: HashSet::new(),
                next_stream: 1,
                next_graph: 1,
                next_exec: 1,
                next_node: 1,
                next_device_node: 1,
                next_capture_id: 1,
            }),
            version,
        }
    }

    /// A new non-default stream on the current device.
    pub fn create_stream(&self) -> SimStream {
        let mut state = self.state.lock();
        let stream = SimStream(state.next_stream);
        state.next_stream += 1;
        let device = state.current_device;
        state.streams.insert(
            stream,
            StreamState {
                device,
                capture: None,
            },
        );
        stream
    }

    pub fn set_current_stream(&self, stream: SimStream) {
        self.state.lock().current_stream = stream;
    }

    pub fn register_kernel(
        &self,
        name: impl Into<String>,
        param_sizes: &[usize],
        body: KernelBody,
    ) -> SimFunction {
        let (offsets, _) = param_layout(param_sizes);
        let mut state = self.state.lock();
        state.kernels.push(KernelDef {
            name: name.into(),
            offsets,
            sizes: param_sizes.to_vec(),
            body,
        });
        SimFunction(state.kernels.len() as u64 - 1)
    }

    /// Launch `func` on `stream`, or record it if the stream is capturing.
    pub fn launch(&self, stream: SimStream, func: SimFunction, args: &[Vec<u8>]) -> Result<()> {
        let mut state = self.state.lock();
        let def = state
            .kernels
            .get(func.0 as usize)
            .ok_or_else(|| anyhow!("invalid function {func:?}"))?;
        ensure!(
            args.len() == def.sizes.len(),
            "kernel `{}` takes {} arguments, got {}",
            def.name,
            def.sizes.len(),
            args.len()
        );
        let (_, block_size) = param_layout(&def.sizes);
        let mut block = vec![0; block_size];
        for ((arg, &offset), &size) in args.iter().zip(&def.offsets).zip(&def.sizes) {
            ensure!(arg.len() == size, "argument of {} bytes, expected {size}", arg.len());
            block[offset..offset + size].copy_from_slice(arg);
        }
        state.enqueue(
            stream,
            Op::Kernel {
                func: func.0,
                block,
            },
        )
    }

    pub fn memcpy_dtod_async(
        &self,
        stream: SimStream,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
    ) -> Result<()> {
        let linear = |ptr| PitchedPtr {
            ptr,
            pitch: bytes,
            xsize: bytes,
            ysize: 1,
        };
        let params = MemcpyParams {
            src: linear(src),
            src_pos: Pos3::default(),
            dst: linear(dst),
            dst_pos: Pos3::default(),
            extent: Extent3 {
                width: bytes,
                height: 1,
                depth: 1,
            },
            kind: MemcpyKind::DeviceToDevice,
        };
        self.state.lock().enqueue(stream, Op::Memcpy(params))
    }

    pub fn memset_async(
        &self,
        stream: SimStream,
        dst: DevicePtr,
        value: u8,
        bytes: usize,
    ) -> Result<()> {
        let params = MemsetParams {
            dst,
            pitch: bytes,
            value: value as u32,
            element_size: 1,
            width: bytes,
            height: 1,
        };
        self.state.lock().enqueue(stream, Op::Memset(params))
    }

    /// Enqueue a node with no effect, e.g. an event record or a child graph.
    pub fn enqueue_marker(&self, stream: SimStream, kind: NodeKind) -> Result<()> {
        ensure!(
            !matches!(kind, NodeKind::Kernel | NodeKind::Memcpy | NodeKind::Memset),
            "{kind:?} nodes carry parameters and cannot be markers"
        );
        self.state.lock().enqueue(stream, Op::Marker(kind))
    }

    pub fn write_f32s(&self, ptr: DevicePtr, values: &[f32]) -> Result<()> {
        self.state.lock().memory.write_f32s(ptr, values)
    }

    pub fn read_f32s(&self, ptr: DevicePtr, n: usize) -> Result<Vec<f32>> {
        self.state.lock().memory.read_f32s(ptr, n)
    }

    pub fn read_bytes(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>> {
        Ok(self.state.lock().memory.read(ptr, len)?.to_vec())
    }

    /// Fail allocations that would take live memory past `bytes`.
    pub fn set_memory_limit(&self, bytes: Option<usize>) {
        self.state.lock().memory.limit = bytes;
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().memory.allocations.len()
    }

    pub fn counters(&self) -> SimCounters {
        self.state.lock().counters
    }

    pub fn live_graphs(&self) -> usize {
        self.state.lock().graphs.len()
    }

    pub fn live_execs(&self) -> usize {
        self.state.lock().execs.len()
    }

    pub fn exec_flags(&self, exec: SimGraphExec) -> Option<InstantiateFlags> {
        self.state.lock().execs.get(&exec).map(|e| e.flags)
    }

    /// Make the next call at `point` fail.
    pub fn arm_failure(&self, point: FailPoint) {
        self.state.lock().armed.insert(point);
    }
}

impl Driver for SimDriver {
    type Stream = SimStream;
    type Graph = SimGraph;
    type GraphExec = SimGraphExec;
    type Node = SimNode;

    fn current_device(&self) -> Result<DeviceIndex> {
        Ok(self.state.lock().current_device)
    }

    fn set_current_device(&self, device: DeviceIndex) -> Result<()> {
        ensure!((0..DEVICE_COUNT).contains(&device), "invalid device ordinal {device}");
        self.state.lock().current_device = device;
        Ok(())
    }

    fn current_stream(&self) -> SimStream {
        self.state.lock().current_stream
    }

    fn default_stream(&self) -> SimStream {
        SimStream(0)
    }

    fn stream_device(&self, stream: SimStream) -> Result<DeviceIndex> {
        Ok(self.state.lock().stream(stream)?.device)
    }

    fn driver_version(&self) -> Result<i32> {
        Ok(self.version)
    }

    fn device_synchronize(&self) -> Result<()> {
        self.state.lock().counters.synchronizations += 1;
        Ok(())
    }

    fn stream_begin_capture(&self, stream: SimStream, _mode: CaptureMode) -> Result<()> {
        ensure!(
            stream != SimStream(0),
            "operation not permitted when stream is the legacy default stream"
        );
        let mut state = self.state.lock();
        ensure!(
            state.stream(stream)?.capture.is_none(),
            "stream {stream:?} is already capturing"
        );
        let graph = SimGraph(state.next_graph);
        state.next_graph += 1;
        let id = state.next_capture_id;
        state.next_capture_id += 1;
        state.graphs.insert(graph, Vec::new());
        if let Some(s) = state.streams.get_mut(&stream) {
            s.capture = Some((id, graph));
        }
        Ok(())
    }

    fn stream_capture_info(&self, stream: SimStream) -> Result<(CaptureStatus, CaptureId)> {
        let mut state = self.state.lock();
        state.trip(FailPoint::CaptureInfo)?;
        Ok(match state.stream(stream)?.capture {
            Some((id, _)) => (CaptureStatus::Active, id),
            None => (CaptureStatus::None, 0),
        })
    }

    fn stream_end_capture(&self, stream: SimStream) -> Result<SimGraph> {
        let mut state = self.state.lock();
        let capture = state
            .streams
            .get_mut(&stream)
            .ok_or_else(|| anyhow!("invalid stream {stream:?}"))?
            .capture
            .take();
        let (_, graph) = capture.ok_or_else(|| anyhow!("stream {stream:?} is not capturing"))?;
        if let Err(e) = state.trip(FailPoint::EndCapture) {
            // The driver invalidates and discards the capture.
            if let Some(nodes) = state.graphs.remove(&graph) {
                for node in nodes {
                    state.nodes.remove(&node);
                }
            }
            return Err(e);
        }
        Ok(graph)
    }

    fn graph_nodes(&self, graph: SimGraph) -> Result<Vec<SimNode>> {
        self.state
            .lock()
            .graphs
            .get(&graph)
            .cloned()
            .ok_or_else(|| anyhow!("invalid graph {graph:?}"))
    }

    fn node_kind(&self, node: SimNode) -> Result<NodeKind> {
        let state = self.state.lock();
        let record = state
            .nodes
            .get(&node)
            .ok_or_else(|| anyhow!("invalid node {node:?}"))?;
        Ok(record.op.kind())
    }

    fn kernel_node_params(&self, node: SimNode) -> Result<KernelNodeParams> {
        let state = self.state.lock();
        let record = state
            .nodes
            .get(&node)
            .ok_or_else(|| anyhow!("invalid node {node:?}"))?;
        let Op::Kernel { func, block } = &record.op else {
            bail!("node {node:?} is not a kernel node");
        };
        let def = &state.kernels[*func as usize];
        let params = def
            .offsets
            .iter()
            .zip(&def.sizes)
            .map(|(&offset, &size)| KernelParam {
                offset,
                bytes: block[offset..offset + size].to_vec(),
            })
            .collect();
        Ok(KernelNodeParams {
            func: *func,
            name: def.name.clone(),
            params,
        })
    }

    fn memcpy_node_params(&self, node: SimNode) -> Result<MemcpyParams> {
        match self.state.lock().nodes.get(&node).map(|r| &r.op) {
            Some(Op::Memcpy(p)) => Ok(*p),
            _ => bail!("node {node:?} is not a memcpy node"),
        }
    }

    fn memset_node_params(&self, node: SimNode) -> Result<MemsetParams> {
        match self.state.lock().nodes.get(&node).map(|r| &r.op) {
            Some(Op::Memset(p)) => Ok(*p),
            _ => bail!("node {node:?} is not a memset node"),
        }
    }

    fn set_device_updatable(&self, node: SimNode) -> Result<DeviceNode> {
        let mut state = self.state.lock();
        let next = state.next_device_node;
        let record = state
            .nodes
            .get_mut(&node)
            .ok_or_else(|| anyhow!("invalid node {node:?}"))?;
        ensure!(
            matches!(record.op, Op::Kernel { .. }),
            "only kernel nodes can be device-updatable"
        );
        if let Some(device_node) = record.device_node {
            return Ok(device_node);
        }
        let device_node = DeviceNode(DEVICE_NODE_BASE + next);
        record.device_node = Some(device_node);
        state.next_device_node += 1;
        Ok(device_node)
    }

    fn instantiate(&self, graph: SimGraph, flags: InstantiateFlags) -> Result<SimGraphExec> {
        let mut state = self.state.lock();
        state.trip(FailPoint::Instantiate)?;
        let node_ids = state
            .graphs
            .get(&graph)
            .cloned()
            .ok_or_else(|| anyhow!("invalid graph {graph:?}"))?;
        let exec = SimGraphExec(state.next_exec);
        state.next_exec += 1;
        let mut nodes = Vec::with_capacity(node_ids.len());
        for (index, id) in node_ids.into_iter().enumerate() {
            let record = &state.nodes[&id];
            let op = record.op.clone();
            if let Some(device_node) = record.device_node {
                state.device_nodes.insert(device_node, (exec, index));
            }
            nodes.push((id, op));
        }
        state.execs.insert(exec, ExecState { nodes, flags });
        Ok(exec)
    }

    fn graph_launch(&self, exec: SimGraphExec, stream: SimStream) -> Result<()> {
        let mut state = self.state.lock();
        state.trip(FailPoint::GraphLaunch)?;
        ensure!(
            state.stream(stream)?.capture.is_none(),
            "launching a graph into a capturing stream is not supported"
        );
        let ops: Vec<Op> = state
            .execs
            .get(&exec)
            .ok_or_else(|| anyhow!("invalid graph exec {exec:?}"))?
            .nodes
            .iter()
            .map(|(_, op)| op.clone())
            .collect();
        for op in &ops {
            state.run(op)?;
        }
        state.counters.graph_launches += 1;
        Ok(())
    }

    fn graph_upload(&self, exec: SimGraphExec, _stream: SimStream) -> Result<()> {
        let mut state = self.state.lock();
        ensure!(state.execs.contains_key(&exec), "invalid graph exec {exec:?}");
        state.counters.graph_uploads += 1;
        Ok(())
    }

    fn exec_set_node_params(
        &self,
        exec: SimGraphExec,
        node: SimNode,
        params: &NodeParams,
    ) -> Result<()> {
        let mut state = self.state.lock();
        ensure!(
            state.nodes.contains_key(&node),
            "node {node:?} belongs to a destroyed graph"
        );
        let slot = state
            .execs
            .get_mut(&exec)
            .ok_or_else(|| anyhow!("invalid graph exec {exec:?}"))?
            .nodes
            .iter_mut()
            .find(|(id, _)| *id == node)
            .map(|(_, op)| op)
            .ok_or_else(|| anyhow!("node {node:?} is not part of {exec:?}"))?;
        match (slot, params) {
            (slot @ Op::Memcpy(_), NodeParams::Memcpy(p)) => *slot = Op::Memcpy(*p),
            (slot @ Op::Memset(_), NodeParams::Memset(p)) => *slot = Op::Memset(*p),
            (slot, _) => bail!("parameter kind does not match {:?} node", slot.kind()),
        }
        state.counters.node_param_sets += 1;
        Ok(())
    }

    fn graph_destroy(&self, graph: SimGraph) -> Result<()> {
        let mut state = self.state.lock();
        state.trip(FailPoint::GraphDestroy)?;
        let nodes = state
            .graphs
            .remove(&graph)
            .ok_or_else(|| anyhow!("invalid graph {graph:?}"))?;
        for node in nodes {
            state.nodes.remove(&node);
        }
        Ok(())
    }

    fn graph_exec_destroy(&self, exec: SimGraphExec) -> Result<()> {
        let mut state = self.state.lock();
        state.trip(FailPoint::GraphExecDestroy)?;
        state
            .execs
            .remove(&exec)
            .ok_or_else(|| anyhow!("invalid graph exec {exec:?}"))?;
        state.device_nodes.retain(|_, (e, _)| *e != exec);
        Ok(())
    }

    fn debug_dot_print(&self, graph: SimGraph, path: &Path, verbose: bool) -> Result<()> {
        let state = self.state.lock();
        let nodes = state
            .graphs
            .get(&graph)
            .ok_or_else(|| anyhow!("invalid graph {graph:?}"))?;
        let mut dot = String::from("digraph dot {\n");
        for (i, id) in nodes.iter().enumerate() {
            let record = &state.nodes[id];
            let label = match &record.op {
                Op::Kernel { func, block } if verbose => format!(
                    "{}\\nparams: {} bytes",
                    state.kernels[*func as usize].name,
                    block.len()
                ),
                Op::Kernel { func, .. } => state.kernels[*func as usize].name.clone(),
                Op::Memcpy(p) if verbose => format!("MEMCPY\\n{} bytes", p.extent.width),
                Op::Memset(p) if verbose => format!("MEMSET\\nvalue {}", p.value),
                op => format!("{:?}", op.kind()).to_uppercase(),
            };
            let _ = writeln!(dot, "  node{i} [label=\"{label}\"];");
            if i > 0 {
                let _ = writeln!(dot, "  node{} -> node{i};", i - 1);
            }
        }
        dot.push_str("}\n");
        std::fs::write(path, dot)?;
        Ok(())
    }

    fn mem_alloc(&self, size: usize, stream: SimStream) -> Result<DevicePtr> {
        let mut state = self.state.lock();
        state.stream(stream)?;
        state.memory.alloc(size)
    }

    fn mem_free(&self, ptr: DevicePtr) -> Result<()> {
        self.state.lock().memory.free(ptr)
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        len: usize,
        stream: SimStream,
    ) -> Result<()> {
        // SAFETY: the caller guarantees `src` is valid for `len` bytes.
        let host = unsafe { std::slice::from_raw_parts(src, len) };
        let mut state = self.state.lock();
        ensure!(
            state.stream(stream)?.capture.is_none(),
            "host to device copies are not captured by this driver"
        );
        state.memory.write(dst, host)
    }

    fn launch_host_func(&self, stream: SimStream, f: Box<dyn FnOnce() + Send>) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.stream(stream)?;
            state.counters.host_callbacks += 1;
        }
        // Prior work on the stream has already completed.
        f();
        Ok(())
    }

    fn launch_graph_updater(
        &self,
        updates: DevicePtr,
        count: usize,
        stream: SimStream,
    ) -> Result<()> {
        let mut state = self.state.lock();
        ensure!(
            state.stream(stream)?.capture.is_none(),
            "the graph updater cannot run inside a capture"
        );
        state.counters.updater_launches += 1;
        if count == 0 {
            return Ok(());
        }
        let records =
            KernelNodeUpdate::decode(state.memory.read(updates, count * KernelNodeUpdate::SIZE)?);
        for update in records {
            ensure!(
                update.field == KERNEL_NODE_FIELD_PARAM,
                "unsupported kernel node field {}",
                update.field
            );
            let &(exec, index) = state
                .device_nodes
                .get(&update.node)
                .ok_or_else(|| anyhow!("invalid device node {:?}", update.node))?;
            let op = state
                .execs
                .get_mut(&exec)
                .and_then(|e| e.nodes.get_mut(index))
                .map(|(_, op)| op)
                .ok_or_else(|| anyhow!("device node {:?} has no exec node", update.node))?;
            let Op::Kernel { block, .. } = op else {
                bail!("device node {:?} is not a kernel node", update.node);
            };
            let (offset, size) = (update.offset as usize, update.size as usize);
            ensure!(
                size <= 8 && offset + size <= block.len(),
                "parameter update at {offset}+{size} overruns a {} byte block",
                block.len()
            );
            block[offset..offset + size].copy_from_slice(&update.value.to_ne_bytes()[..size]);
            state.counters.applied_kernel_updates += 1;
        }
        Ok(())
    }
}
