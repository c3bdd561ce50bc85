//! Diffing a shared-sentinel capture against a distinct-sentinel recapture.
//!
//! Walks both graphs node by node. Kernel arguments are scanned word by word;
//! words that differ by a multiple of the sentinel stride are pointers into a
//! recorded allocation and become [`KernelParamUpdate`]s, applied on the
//! device at replay time. Memcpy and memset nodes cannot be rewritten on the
//! device and become host-side [`NodePatch`]es instead.

use std::sync::Arc;

use anyhow::Result;

use crate::{
    driver::{
        DeviceNode, DevicePtr, Driver, KernelNodeUpdate, MemcpyParams, MemsetParams, NodeKind,
        NodeParams,
    },
    error::{ensure_graph, GraphError},
    graph::GraphHandle,
    sentinel::{SentinelHit, SentinelLayout, SentinelMode},
};

/// A pointer inside a kernel's parameter block that must be rebased on replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelParamUpdate {
    pub dev_node: DeviceNode,
    /// Byte offset into the kernel's parameter block.
    pub param_offset: usize,
    pub alloc_index: usize,
    /// Byte offset into the allocation.
    pub offset: usize,
}

impl KernelParamUpdate {
    pub fn record(&self, actual: &[DevicePtr]) -> KernelNodeUpdate {
        KernelNodeUpdate::param(
            self.dev_node,
            self.param_offset,
            actual[self.alloc_index] + self.offset as DevicePtr,
        )
    }
}

/// Host-side rewrite of a copy or fill node. Operands without a hit keep
/// their recorded address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodePatch {
    Memcpy {
        recorded: MemcpyParams,
        src: Option<SentinelHit>,
        dst: Option<SentinelHit>,
    },
    Memset {
        recorded: MemsetParams,
        dst: SentinelHit,
    },
}

impl NodePatch {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Memcpy { .. } => NodeKind::Memcpy,
            Self::Memset { .. } => NodeKind::Memset,
        }
    }

    /// Full node parameters for a replay over `actual`.
    pub fn compute(&self, actual: &[DevicePtr]) -> NodeParams {
        match self {
            Self::Memcpy { recorded, src, dst } => {
                let mut params = *recorded;
                if let Some(hit) = src {
                    params.src.ptr = hit.resolve(actual);
                }
                if let Some(hit) = dst {
                    params.dst.ptr = hit.resolve(actual);
                }
                NodeParams::Memcpy(params)
            }
            Self::Memset { recorded, dst } => NodeParams::Memset(MemsetParams {
                dst: dst.resolve(actual),
                ..*recorded
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphNodeParamUpdate<N> {
    pub node: N,
    pub patch: NodePatch,
}

impl<D: Driver> GraphHandle<D> {
    /// Derive the patch lists for dynamic replay from `other`, a recapture of
    /// the same program in [`SentinelMode::Distinct`], then instantiate.
    ///
    /// `self` must be an un-instantiated [`SentinelMode::Shared`] capture with
    /// the same allocation schema as `other`.
    pub fn compare_with_recapture(&mut self, other: &GraphHandle<D>) -> Result<()> {
        ensure_graph!(
            self.sentinel_mode == SentinelMode::Shared,
            Precondition,
            "this graph must have been captured in sentinel mode 1, got {:?}",
            self.sentinel_mode
        );
        ensure_graph!(
            other.sentinel_mode == SentinelMode::Distinct,
            Precondition,
            "the other graph must have been captured in sentinel mode 2, got {:?}",
            other.sentinel_mode
        );
        ensure_graph!(
            self.allocation_sizes == other.allocation_sizes,
            Precondition,
            "both graphs must make the same allocations in the same order with the same sizes: {:?} vs {:?}",
            self.allocation_sizes,
            other.allocation_sizes
        );
        ensure_graph!(self.has_graph, Precondition, "this graph holds no capture");
        ensure_graph!(
            !self.has_graph_exec,
            Precondition,
            "this graph is already instantiated"
        );
        ensure_graph!(other.has_graph, Precondition, "the recapture holds no graph");

        let driver = Arc::clone(self.ctx.driver());
        let layout = self.ctx.config().sentinel;
        let nodes1 = driver.graph_nodes(self.graph_raw()?)?;
        let nodes2 = driver.graph_nodes(other.graph_raw()?)?;
        ensure_graph!(
            nodes1.len() == nodes2.len(),
            StructuralMismatch,
            "captured {} nodes, recaptured {}",
            nodes1.len(),
            nodes2.len()
        );
        tracing::debug!(nodes = nodes1.len(), "diffing sentinel captures");

        let differ = Differ {
            driver: driver.as_ref(),
            layout,
            schema: &self.allocation_sizes,
        };
        let mut kernel_updates = Vec::new();
        let mut node_updates = Vec::new();
        for (index, (&node1, &node2)) in nodes1.iter().zip(&nodes2).enumerate() {
            let kind1 = driver.node_kind(node1)?;
            let kind2 = driver.node_kind(node2)?;
            ensure_graph!(
                kind1 == kind2,
                StructuralMismatch,
                "node {index} is {kind1:?} in the capture and {kind2:?} in the recapture"
            );
            match kind1 {
                NodeKind::Kernel => {
                    differ.kernel(index, node1, node2, &mut kernel_updates)?;
                }
                NodeKind::Memcpy => {
                    if let Some(patch) = differ.memcpy(index, node1, node2)? {
                        node_updates.push(GraphNodeParamUpdate { node: node1, patch });
                    }
                }
                NodeKind::Memset => {
                    if let Some(patch) = differ.memset(index, node1, node2)? {
                        node_updates.push(GraphNodeParamUpdate { node: node1, patch });
                    }
                }
                NodeKind::Graph | NodeKind::Conditional | NodeKind::BatchMemOp => {
                    return Err(GraphError::UnsupportedNode(kind1).into());
                }
                NodeKind::Empty
                | NodeKind::WaitEvent
                | NodeKind::Host
                | NodeKind::EventRecord
                | NodeKind::ExtSemaphoreSignal
                | NodeKind::ExtSemaphoreWait
                | NodeKind::MemAlloc
                | NodeKind::MemFree => {}
            }
        }

        // Set before instantiating: the node patches decide whether the
        // captured graph is kept.
        self.kernel_param_updates = kernel_updates;
        self.graph_node_param_updates = node_updates;

        // Device-updatable attributes only take effect on exec graphs
        // instantiated after they were set.
        if let Err(e) = self.instantiate() {
            self.kernel_param_updates.clear();
            self.graph_node_param_updates.clear();
            return Err(e);
        }
        tracing::debug!(
            kernel_updates = self.kernel_param_updates.len(),
            node_updates = self.graph_node_param_updates.len(),
            "dynamic patch lists ready"
        );
        self.has_compared_against_recapture = true;
        Ok(())
    }
}

struct Differ<'a, D: Driver> {
    driver: &'a D,
    layout: SentinelLayout,
    schema: &'a [usize],
}

impl<D: Driver> Differ<'_, D> {
    fn kernel(
        &self,
        index: usize,
        node1: D::Node,
        node2: D::Node,
        updates: &mut Vec<KernelParamUpdate>,
    ) -> Result<()> {
        let params1 = self.driver.kernel_node_params(node1)?;
        let params2 = self.driver.kernel_node_params(node2)?;
        ensure_graph!(
            params1.func == params2.func,
            StructuralMismatch,
            "node {index} launches `{}` in the capture and `{}` in the recapture",
            params1.name,
            params2.name
        );
        ensure_graph!(
            params1.params.len() == params2.params.len(),
            StructuralMismatch,
            "kernel `{}` at node {index} has differing parameter lists",
            params1.name
        );

        let mut dev_node = None;
        for (param_index, (arg1, arg2)) in params1.params.iter().zip(&params2.params).enumerate() {
            for ((start, word1), (_, word2)) in arg1.words().zip(arg2.words()) {
                if word1 == word2 {
                    continue;
                }
                let Some(hit) = self.layout.classify(word1, word2, self.schema) else {
                    tracing::debug!(
                        kernel = %params1.name,
                        param_index,
                        start,
                        word1,
                        word2,
                        "differing word is not a sentinel pointer, leaving it unpatched"
                    );
                    continue;
                };
                let dev = match dev_node {
                    Some(dev) => dev,
                    None => {
                        let dev = self.driver.set_device_updatable(node1)?;
                        ensure_graph!(
                            !dev.is_null(),
                            Driver,
                            "driver returned a null device node for kernel `{}`",
                            params1.name
                        );
                        dev_node = Some(dev);
                        dev
                    }
                };
                tracing::debug!(
                    kernel = %params1.name,
                    param_index,
                    start,
                    alloc_index = hit.alloc_index,
                    offset = hit.offset,
                    "argument word is a pointer into a recorded allocation"
                );
                updates.push(KernelParamUpdate {
                    dev_node: dev,
                    param_offset: arg1.offset + start,
                    alloc_index: hit.alloc_index,
                    offset: hit.offset,
                });
            }
        }
        Ok(())
    }

    fn memcpy(&self, index: usize, node1: D::Node, node2: D::Node) -> Result<Option<NodePatch>> {
        let p1 = self.driver.memcpy_node_params(node1)?;
        let p2 = self.driver.memcpy_node_params(node2)?;
        ensure_graph!(
            p1.extent == p2.extent,
            StructuralMismatch,
            "memcpy extent mismatch at node {index}: {:?} vs {:?}",
            p1.extent,
            p2.extent
        );
        ensure_graph!(
            p1.kind == p2.kind,
            StructuralMismatch,
            "memcpy kind mismatch at node {index}: {:?} vs {:?}",
            p1.kind,
            p2.kind
        );
        if p1.src.ptr == p2.src.ptr && p1.dst.ptr == p2.dst.ptr {
            return Ok(None);
        }
        let src = self.layout.classify(p1.src.ptr, p2.src.ptr, self.schema);
        let dst = self.layout.classify(p1.dst.ptr, p2.dst.ptr, self.schema);
        if src.is_none() && dst.is_none() {
            tracing::debug!(index, "memcpy operands differ but are not sentinel pointers");
            return Ok(None);
        }
        Ok(Some(NodePatch::Memcpy {
            recorded: p1,
            src,
            dst,
        }))
    }

    fn memset(&self, index: usize, node1: D::Node, node2: D::Node) -> Result<Option<NodePatch>> {
        let p1 = self.driver.memset_node_params(node1)?;
        let p2 = self.driver.memset_node_params(node2)?;
        ensure_graph!(
            p1.value == p2.value,
            StructuralMismatch,
            "memset value mismatch at node {index}"
        );
        ensure_graph!(
            p1.element_size == p2.element_size,
            StructuralMismatch,
            "memset element size mismatch at node {index}"
        );
        ensure_graph!(
            p1.width == p2.width && p1.height == p2.height,
            StructuralMismatch,
            "memset shape mismatch at node {index}"
        );
        if p1.dst == p2.dst {
            return Ok(None);
        }
        let Some(dst) = self.layout.classify(p1.dst, p2.dst, self.schema) else {
            tracing::debug!(index, "memset destination differs but is not a sentinel pointer");
            return Ok(None);
        };
        Ok(Some(NodePatch::Memset { recorded: p1, dst }))
    }
}
