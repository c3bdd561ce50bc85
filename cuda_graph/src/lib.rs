//! Capture CUDA work into graphs, replay them, and replay them against
//! buffers that did not exist at capture time.
//!
//! A program is captured twice with sentinel pointers standing in for its
//! allocations. [`GraphHandle::compare_with_recapture`] diffs the two
//! captures to find every node argument that holds an allocation address,
//! and [`GraphHandle::replay_dynamic`] patches those arguments with real
//! addresses right before each launch.

mod allocator;
mod config;
mod context;
mod diff;
mod driver;
mod error;
mod graph;
mod recorder;
mod replay;
mod rng;
mod sentinel;

#[cfg(feature = "cuda")]
pub mod cuda;
pub mod sim;

pub use allocator::{AllocatorStats, CachingAllocator, FakeAllocator, HookedAllocator, MempoolId, StreamFilter};
pub use config::GraphConfig;
pub use context::GraphContext;
pub use diff::{GraphNodeParamUpdate, KernelParamUpdate, NodePatch};
pub use driver::{
    CaptureMode, CaptureStatus, DeviceGuard, DeviceIndex, DeviceNode, DevicePtr, Driver,
    InstantiateFlags, KernelNodeParams, KernelNodeUpdate, KernelParam, MemcpyKind, MemcpyParams,
    MemsetParams, NodeKind, NodeParams,
};
pub use error::GraphError;
pub use graph::{GraphDumpFormat, GraphDumpVerbosity, GraphHandle, GraphState};
pub use recorder::AllocationRecorder;
pub use replay::{build_dynamic, PrefilledBuffers, ReplayBuffer};
pub use rng::{GeneratorRegistry, GraphSafeGenerator, PhiloxGenerator};
pub use sentinel::{SentinelHit, SentinelLayout, SentinelMode};
