//! The real driver, on top of the raw CUDA driver API exposed by cudarc.
//!
//! A [`CudaDriver`] serves the single device it was created for. Kernels are
//! launched by the framework on whatever stream it likes; the driver tracks
//! the "current" stream so captures know where to look.

use std::{
    ffi::{c_void, CStr, CString},
    mem::MaybeUninit,
    path::Path,
    ptr,
};

use anyhow::{bail, Context, Result};
use candle_core::{
    cuda::cudarc::driver::{
        sys::{
            self, CUDA_KERNEL_NODE_PARAMS, CUDA_MEMCPY3D, CUDA_MEMSET_NODE_PARAMS, CUcontext,
            CUdeviceptr, CUfunction, CUgraph, CUgraphDebugDot_flags, CUgraphExec,
            CUgraphInstantiate_flags, CUgraphNode, CUgraphNodeType, CUlaunchAttributeID,
            CUlaunchAttributeValue, CUmemorytype, CUmodule, CUresult, CUstream,
            CUstreamCaptureMode, CUstreamCaptureStatus,
        },
        CudaSlice, DeviceSlice,
    },
    Device,
};
use parking_lot::Mutex;

use crate::{
    driver::{
        CaptureId, CaptureMode, CaptureStatus, DeviceIndex, DeviceNode, DevicePtr, Driver,
        Extent3, InstantiateFlags, KernelNodeParams, KernelParam, MemcpyKind, MemcpyParams,
        MemsetParams, NodeKind, NodeParams, PitchedPtr, Pos3,
    },
    error::GraphError,
    replay::ReplayBuffer,
};

mod kernels {
    include!(concat!(env!("OUT_DIR"), "/kernels.rs"));
}

macro_rules! handle {
    ($name:ident, $raw:ty) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub $raw);

        // SAFETY: driver handles are opaque and may be used from any thread.
        unsafe impl Send for $name {}
        unsafe impl Sync for $name {}
    };
}

handle!(CudaStream, CUstream);
handle!(CudaGraph, CUgraph);
handle!(CudaGraphExec, CUgraphExec);
handle!(CudaNode, CUgraphNode);

struct Updater {
    module: CUmodule,
    func: CUfunction,
}

// SAFETY: module and function handles are context-wide and immutable.
unsafe impl Send for Updater {}
unsafe impl Sync for Updater {}

pub struct CudaDriver {
    device: candle_core::cuda::CudaDevice,
    ordinal: DeviceIndex,
    current: Mutex<CudaStream>,
    updater: Updater,
}

impl CudaDriver {
    /// Wrap a CUDA device. The device's own stream becomes the current stream.
    pub fn new(device: &Device) -> Result<Self> {
        let cu_device = match device {
            Device::Cuda(dev) => dev.clone(),
            _ => bail!("Must have CUDA device."),
        };
        let ordinal = cu_device.ordinal() as DeviceIndex;
        let stream = CudaStream(*cu_device.cu_stream());

        // Modules cannot be loaded while a stream is capturing, so the
        // updater is loaded up front.
        let ptx = CString::new(kernels::GRAPH_UPDATER)?;
        let mut module = MaybeUninit::uninit();
        unsafe {
            sys::lib()
                .cuModuleLoadData(module.as_mut_ptr(), ptx.as_ptr() as *const c_void)
                .result()?;
        }
        let module = unsafe { module.assume_init() };
        let name = CString::new("graph_updater")?;
        let mut func = MaybeUninit::uninit();
        unsafe {
            sys::lib()
                .cuModuleGetFunction(func.as_mut_ptr(), module, name.as_ptr())
                .result()?;
        }
        let func = unsafe { func.assume_init() };

        Ok(Self {
            device: cu_device,
            ordinal,
            current: Mutex::new(stream),
            updater: Updater { module, func },
        })
    }

    pub fn device(&self) -> &candle_core::cuda::CudaDevice {
        &self.device
    }

    pub fn set_current_stream(&self, stream: CudaStream) {
        *self.current.lock() = stream;
    }

    fn context(&self) -> Result<CUcontext> {
        let mut ctx = MaybeUninit::uninit();
        unsafe {
            sys::lib().cuCtxGetCurrent(ctx.as_mut_ptr()).result()?;
            Ok(ctx.assume_init())
        }
    }
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        if let Err(e) = unsafe { sys::lib().cuModuleUnload(self.updater.module) }.result() {
            tracing::warn!("failed to unload the graph updater module: {e}");
        }
    }
}

fn node_kind(kind: CUgraphNodeType) -> Result<NodeKind, GraphError> {
    use CUgraphNodeType::*;
    Ok(match kind {
        CU_GRAPH_NODE_TYPE_KERNEL => NodeKind::Kernel,
        CU_GRAPH_NODE_TYPE_MEMCPY => NodeKind::Memcpy,
        CU_GRAPH_NODE_TYPE_MEMSET => NodeKind::Memset,
        CU_GRAPH_NODE_TYPE_HOST => NodeKind::Host,
        CU_GRAPH_NODE_TYPE_GRAPH => NodeKind::Graph,
        CU_GRAPH_NODE_TYPE_EMPTY => NodeKind::Empty,
        CU_GRAPH_NODE_TYPE_WAIT_EVENT => NodeKind::WaitEvent,
        CU_GRAPH_NODE_TYPE_EVENT_RECORD => NodeKind::EventRecord,
        CU_GRAPH_NODE_TYPE_EXT_SEMAS_SIGNAL => NodeKind::ExtSemaphoreSignal,
        CU_GRAPH_NODE_TYPE_EXT_SEMAS_WAIT => NodeKind::ExtSemaphoreWait,
        CU_GRAPH_NODE_TYPE_MEM_ALLOC => NodeKind::MemAlloc,
        CU_GRAPH_NODE_TYPE_MEM_FREE => NodeKind::MemFree,
        CU_GRAPH_NODE_TYPE_BATCH_MEM_OP => NodeKind::BatchMemOp,
        CU_GRAPH_NODE_TYPE_CONDITIONAL => NodeKind::Conditional,
        #[allow(unreachable_patterns)]
        other => return Err(GraphError::UnknownNodeType(other as u32)),
    })
}

fn memcpy_kind(src: CUmemorytype, dst: CUmemorytype) -> MemcpyKind {
    use CUmemorytype::*;
    match (src, dst) {
        (CU_MEMORYTYPE_HOST, CU_MEMORYTYPE_HOST) => MemcpyKind::HostToHost,
        (CU_MEMORYTYPE_HOST, CU_MEMORYTYPE_DEVICE) => MemcpyKind::HostToDevice,
        (CU_MEMORYTYPE_DEVICE, CU_MEMORYTYPE_HOST) => MemcpyKind::DeviceToHost,
        (CU_MEMORYTYPE_DEVICE, CU_MEMORYTYPE_DEVICE) => MemcpyKind::DeviceToDevice,
        _ => MemcpyKind::Default,
    }
}

fn operand(memory_type: CUmemorytype, host: *const c_void, device: CUdeviceptr) -> DevicePtr {
    match memory_type {
        CUmemorytype::CU_MEMORYTYPE_HOST => host as DevicePtr,
        _ => device,
    }
}

/// Memory types of the (src, dst) operands of a copy of `kind`.
fn memory_types(kind: MemcpyKind) -> (CUmemorytype, CUmemorytype) {
    use CUmemorytype::*;
    match kind {
        MemcpyKind::HostToHost => (CU_MEMORYTYPE_HOST, CU_MEMORYTYPE_HOST),
        MemcpyKind::HostToDevice => (CU_MEMORYTYPE_HOST, CU_MEMORYTYPE_DEVICE),
        MemcpyKind::DeviceToHost => (CU_MEMORYTYPE_DEVICE, CU_MEMORYTYPE_HOST),
        MemcpyKind::DeviceToDevice => (CU_MEMORYTYPE_DEVICE, CU_MEMORYTYPE_DEVICE),
        MemcpyKind::Default => (CU_MEMORYTYPE_UNIFIED, CU_MEMORYTYPE_UNIFIED),
    }
}

/// Rebuild the driver descriptor from parameters read at diff time.
fn to_memcpy3d(p: &MemcpyParams) -> CUDA_MEMCPY3D {
    let (src_type, dst_type) = memory_types(p.kind);
    let host = |memory_type, ptr: DevicePtr| match memory_type {
        CUmemorytype::CU_MEMORYTYPE_HOST => (ptr as *mut c_void, 0),
        _ => (ptr::null_mut(), ptr),
    };
    let (src_host, src_device) = host(src_type, p.src.ptr);
    let (dst_host, dst_device) = host(dst_type, p.dst.ptr);
    CUDA_MEMCPY3D {
        srcXInBytes: p.src_pos.x,
        srcY: p.src_pos.y,
        srcZ: p.src_pos.z,
        srcLOD: 0,
        srcMemoryType: src_type,
        srcHost: src_host as *const c_void,
        srcDevice: src_device,
        srcArray: ptr::null_mut(),
        reserved0: ptr::null_mut(),
        srcPitch: p.src.pitch,
        srcHeight: p.src.ysize,
        dstXInBytes: p.dst_pos.x,
        dstY: p.dst_pos.y,
        dstZ: p.dst_pos.z,
        dstLOD: 0,
        dstMemoryType: dst_type,
        dstHost: dst_host,
        dstDevice: dst_device,
        dstArray: ptr::null_mut(),
        reserved1: ptr::null_mut(),
        dstPitch: p.dst.pitch,
        dstHeight: p.dst.ysize,
        WidthInBytes: p.extent.width,
        Height: p.extent.height,
        Depth: p.extent.depth,
    }
}

impl Driver for CudaDriver {
    type Stream = CudaStream;
    type Graph = CudaGraph;
    type GraphExec = CudaGraphExec;
    type Node = CudaNode;

    fn current_device(&self) -> Result<DeviceIndex> {
        Ok(self.ordinal)
    }

    fn set_current_device(&self, device: DeviceIndex) -> Result<()> {
        if device != self.ordinal {
            bail!("this driver serves device {}, not {device}", self.ordinal);
        }
        Ok(())
    }

    fn current_stream(&self) -> CudaStream {
        *self.current.lock()
    }

    fn default_stream(&self) -> CudaStream {
        CudaStream(ptr::null_mut())
    }

    fn stream_device(&self, _stream: CudaStream) -> Result<DeviceIndex> {
        Ok(self.ordinal)
    }

    fn driver_version(&self) -> Result<i32> {
        let mut version = 0;
        unsafe { sys::lib().cuDriverGetVersion(&mut version) }.result()?;
        Ok(version)
    }

    fn device_synchronize(&self) -> Result<()> {
        unsafe { sys::lib().cuCtxSynchronize() }.result()?;
        Ok(())
    }

    fn stream_begin_capture(&self, stream: CudaStream, mode: CaptureMode) -> Result<()> {
        let mode = match mode {
            CaptureMode::Global => CUstreamCaptureMode::CU_STREAM_CAPTURE_MODE_GLOBAL,
            CaptureMode::ThreadLocal => CUstreamCaptureMode::CU_STREAM_CAPTURE_MODE_THREAD_LOCAL,
            CaptureMode::Relaxed => CUstreamCaptureMode::CU_STREAM_CAPTURE_MODE_RELAXED,
        };
        unsafe { sys::lib().cuStreamBeginCapture_v2(stream.0, mode) }.result()?;
        Ok(())
    }

    fn stream_capture_info(&self, stream: CudaStream) -> Result<(CaptureStatus, CaptureId)> {
        let mut status = MaybeUninit::uninit();
        let mut id = 0;
        unsafe {
            sys::lib()
                .cuStreamGetCaptureInfo_v2(
                    stream.0,
                    status.as_mut_ptr(),
                    &mut id,
                    ptr::null_mut(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                )
                .result()?;
        }
        let status = match unsafe { status.assume_init() } {
            CUstreamCaptureStatus::CU_STREAM_CAPTURE_STATUS_NONE => CaptureStatus::None,
            CUstreamCaptureStatus::CU_STREAM_CAPTURE_STATUS_ACTIVE => CaptureStatus::Active,
            CUstreamCaptureStatus::CU_STREAM_CAPTURE_STATUS_INVALIDATED => {
                CaptureStatus::Invalidated
            }
        };
        Ok((status, id))
    }

    fn stream_end_capture(&self, stream: CudaStream) -> Result<CudaGraph> {
        let mut graph = MaybeUninit::uninit();
        unsafe {
            sys::lib()
                .cuStreamEndCapture(stream.0, graph.as_mut_ptr())
                .result()?;
            Ok(CudaGraph(graph.assume_init()))
        }
    }

    fn graph_nodes(&self, graph: CudaGraph) -> Result<Vec<CudaNode>> {
        let mut count = 0;
        unsafe { sys::lib().cuGraphGetNodes(graph.0, ptr::null_mut(), &mut count) }.result()?;
        let mut nodes = vec![ptr::null_mut(); count];
        unsafe { sys::lib().cuGraphGetNodes(graph.0, nodes.as_mut_ptr(), &mut count) }
            .result()?;
        nodes.truncate(count);
        Ok(nodes.into_iter().map(CudaNode).collect())
    }

    fn node_kind(&self, node: CudaNode) -> Result<NodeKind> {
        let mut kind = MaybeUninit::uninit();
        unsafe {
            sys::lib()
                .cuGraphNodeGetType(node.0, kind.as_mut_ptr())
                .result()?;
            Ok(node_kind(kind.assume_init())?)
        }
    }

    fn kernel_node_params(&self, node: CudaNode) -> Result<KernelNodeParams> {
        let mut raw = MaybeUninit::<CUDA_KERNEL_NODE_PARAMS>::uninit();
        let raw = unsafe {
            sys::lib()
                .cuGraphKernelNodeGetParams_v2(node.0, raw.as_mut_ptr())
                .result()?;
            raw.assume_init()
        };
        if raw.kernelParams.is_null() {
            bail!("kernel node was launched with packed `extra` arguments, which cannot be introspected");
        }

        let name = {
            let mut name = ptr::null();
            unsafe { sys::lib().cuFuncGetName(&mut name, raw.func) }.result()?;
            unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
        };

        let mut params = Vec::new();
        for index in 0.. {
            let (mut offset, mut size) = (0, 0);
            let status =
                unsafe { sys::lib().cuFuncGetParamInfo(raw.func, index, &mut offset, &mut size) };
            if status == CUresult::CUDA_ERROR_INVALID_VALUE {
                break;
            }
            status.result()?;
            // SAFETY: kernelParams[i] points at an argument of `size` bytes.
            let bytes = unsafe {
                let arg = *raw.kernelParams.add(index);
                std::slice::from_raw_parts(arg as *const u8, size).to_vec()
            };
            params.push(KernelParam { offset, bytes });
        }

        Ok(KernelNodeParams {
            func: raw.func as u64,
            name,
            params,
        })
    }

    fn memcpy_node_params(&self, node: CudaNode) -> Result<MemcpyParams> {
        let mut raw = MaybeUninit::<CUDA_MEMCPY3D>::uninit();
        let p = unsafe {
            sys::lib()
                .cuGraphMemcpyNodeGetParams(node.0, raw.as_mut_ptr())
                .result()?;
            raw.assume_init()
        };
        if [p.srcMemoryType, p.dstMemoryType].contains(&CUmemorytype::CU_MEMORYTYPE_ARRAY) {
            return Err(GraphError::UnsupportedNode(NodeKind::Memcpy).into());
        }
        Ok(MemcpyParams {
            src: PitchedPtr {
                ptr: operand(p.srcMemoryType, p.srcHost, p.srcDevice),
                pitch: p.srcPitch,
                xsize: p.WidthInBytes,
                ysize: p.srcHeight,
            },
            src_pos: Pos3 {
                x: p.srcXInBytes,
                y: p.srcY,
                z: p.srcZ,
            },
            dst: PitchedPtr {
                ptr: operand(p.dstMemoryType, p.dstHost as *const c_void, p.dstDevice),
                pitch: p.dstPitch,
                xsize: p.WidthInBytes,
                ysize: p.dstHeight,
            },
            dst_pos: Pos3 {
                x: p.dstXInBytes,
                y: p.dstY,
                z: p.dstZ,
            },
            extent: Extent3 {
                width: p.WidthInBytes,
                height: p.Height,
                depth: p.Depth,
            },
            kind: memcpy_kind(p.srcMemoryType, p.dstMemoryType),
        })
    }

    fn memset_node_params(&self, node: CudaNode) -> Result<MemsetParams> {
        let mut raw = MaybeUninit::<CUDA_MEMSET_NODE_PARAMS>::uninit();
        let p = unsafe {
            sys::lib()
                .cuGraphMemsetNodeGetParams(node.0, raw.as_mut_ptr())
                .result()?;
            raw.assume_init()
        };
        Ok(MemsetParams {
            dst: p.dst,
            pitch: p.pitch,
            value: p.value,
            element_size: p.elementSize,
            width: p.width,
            height: p.height,
        })
    }

    fn set_device_updatable(&self, node: CudaNode) -> Result<DeviceNode> {
        let mut value: CUlaunchAttributeValue = unsafe { std::mem::zeroed() };
        value.deviceUpdatableKernelNode.deviceUpdatable = 1;
        // The driver writes the device node handle back into `value`.
        let value_ptr: *mut CUlaunchAttributeValue = &mut value;
        unsafe {
            sys::lib()
                .cuGraphKernelNodeSetAttribute(
                    node.0,
                    CUlaunchAttributeID::CU_LAUNCH_ATTRIBUTE_DEVICE_UPDATABLE_KERNEL_NODE,
                    value_ptr as *const CUlaunchAttributeValue,
                )
                .result()?;
        }
        let dev_node = unsafe { value.deviceUpdatableKernelNode.devNode };
        Ok(DeviceNode(dev_node as u64))
    }

    fn instantiate(&self, graph: CudaGraph, flags: InstantiateFlags) -> Result<CudaGraphExec> {
        let flags = if flags.auto_free_on_launch {
            CUgraphInstantiate_flags::CUDA_GRAPH_INSTANTIATE_FLAG_AUTO_FREE_ON_LAUNCH as u64
        } else {
            0
        };
        let mut exec = MaybeUninit::uninit();
        unsafe {
            sys::lib()
                .cuGraphInstantiateWithFlags(exec.as_mut_ptr(), graph.0, flags)
                .result()?;
            Ok(CudaGraphExec(exec.assume_init()))
        }
    }

    fn graph_launch(&self, exec: CudaGraphExec, stream: CudaStream) -> Result<()> {
        unsafe { sys::lib().cuGraphLaunch(exec.0, stream.0) }.result()?;
        Ok(())
    }

    fn graph_upload(&self, exec: CudaGraphExec, stream: CudaStream) -> Result<()> {
        unsafe { sys::lib().cuGraphUpload(exec.0, stream.0) }.result()?;
        Ok(())
    }

    fn exec_set_node_params(
        &self,
        exec: CudaGraphExec,
        node: CudaNode,
        params: &NodeParams,
    ) -> Result<()> {
        let ctx = self.context()?;
        match params {
            NodeParams::Memcpy(p) => {
                let raw = to_memcpy3d(p);
                unsafe { sys::lib().cuGraphExecMemcpyNodeSetParams(exec.0, node.0, &raw, ctx) }
                    .result()?;
            }
            NodeParams::Memset(p) => {
                let raw = CUDA_MEMSET_NODE_PARAMS {
                    dst: p.dst,
                    pitch: p.pitch,
                    value: p.value,
                    elementSize: p.element_size,
                    width: p.width,
                    height: p.height,
                };
                unsafe { sys::lib().cuGraphExecMemsetNodeSetParams(exec.0, node.0, &raw, ctx) }
                    .result()?;
            }
        }
        Ok(())
    }

    fn graph_destroy(&self, graph: CudaGraph) -> Result<()> {
        unsafe { sys::lib().cuGraphDestroy(graph.0) }.result()?;
        Ok(())
    }

    fn graph_exec_destroy(&self, exec: CudaGraphExec) -> Result<()> {
        unsafe { sys::lib().cuGraphExecDestroy(exec.0) }.result()?;
        Ok(())
    }

    fn debug_dot_print(&self, graph: CudaGraph, path: &Path, verbose: bool) -> Result<()> {
        let path = CString::new(path.to_string_lossy().as_bytes())
            .context("graph dump path contains a NUL byte")?;
        let flags = if verbose {
            CUgraphDebugDot_flags::CU_GRAPH_DEBUG_DOT_FLAGS_VERBOSE as u32
        } else {
            0
        };
        unsafe { sys::lib().cuGraphDebugDotPrint(graph.0, path.as_ptr(), flags) }.result()?;
        Ok(())
    }

    fn mem_alloc(&self, size: usize, _stream: CudaStream) -> Result<DevicePtr> {
        // Plain allocations are forbidden on a globally capturing thread;
        // relax the mode for the duration of the call.
        let mut mode = CUstreamCaptureMode::CU_STREAM_CAPTURE_MODE_RELAXED;
        unsafe { sys::lib().cuThreadExchangeStreamCaptureMode(&mut mode) }.result()?;
        let mut ptr = 0;
        let alloc = unsafe { sys::lib().cuMemAlloc_v2(&mut ptr, size) }.result();
        unsafe { sys::lib().cuThreadExchangeStreamCaptureMode(&mut mode) }.result()?;
        alloc?;
        Ok(ptr)
    }

    fn mem_free(&self, ptr: DevicePtr) -> Result<()> {
        unsafe { sys::lib().cuMemFree_v2(ptr) }.result()?;
        Ok(())
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        len: usize,
        stream: CudaStream,
    ) -> Result<()> {
        sys::lib()
            .cuMemcpyHtoDAsync_v2(dst, src as *const c_void, len, stream.0)
            .result()?;
        Ok(())
    }

    fn launch_host_func(&self, stream: CudaStream, f: Box<dyn FnOnce() + Send>) -> Result<()> {
        unsafe extern "C" fn trampoline(data: *mut c_void) {
            let f = Box::from_raw(data as *mut Box<dyn FnOnce() + Send>);
            f();
        }
        let data = Box::into_raw(Box::new(f)) as *mut c_void;
        let status = unsafe { sys::lib().cuLaunchHostFunc(stream.0, Some(trampoline), data) };
        if let Err(e) = status.result() {
            // Work already enqueued may still use what the callback owns; leak it.
            tracing::warn!("failed to enqueue host callback, leaking its captures: {e}");
            return Err(GraphError::from(e).into());
        }
        Ok(())
    }

    fn launch_graph_updater(
        &self,
        updates: DevicePtr,
        count: usize,
        stream: CudaStream,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        const BLOCK: u32 = 128;
        let grid = (count as u32).div_ceil(BLOCK);
        let mut updates = updates;
        let mut count = count as u64;
        let mut args = [
            &mut updates as *mut DevicePtr as *mut c_void,
            &mut count as *mut u64 as *mut c_void,
        ];
        unsafe {
            sys::lib()
                .cuLaunchKernel(
                    self.updater.func,
                    grid,
                    1,
                    1,
                    BLOCK,
                    1,
                    1,
                    0,
                    stream.0,
                    args.as_mut_ptr(),
                    ptr::null_mut(),
                )
                .result()?;
        }
        Ok(())
    }
}

impl<T> ReplayBuffer for CudaSlice<T> {
    fn device_ptr(&self) -> DevicePtr {
        *candle_core::cuda::cudarc::driver::DevicePtr::device_ptr(self)
    }

    fn byte_len(&self) -> usize {
        self.len() * std::mem::size_of::<T>()
    }
}
