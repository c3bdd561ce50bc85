//! Sentinel pointers handed out instead of real memory during a capture.
//!
//! In [`SentinelMode::Shared`] every allocation is `base`, so a pointer
//! derived from allocation `i` at offset `o` reads `base + o`. In
//! [`SentinelMode::Distinct`] the same pointer reads
//! `base + stride * (1 + i) + o`. Diffing the two recovers `(i, o)`.

use crate::{driver::DevicePtr, error::GraphError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SentinelMode {
    /// Real allocations.
    #[default]
    Off,
    /// Every allocation returns the same pointer.
    Shared,
    /// Every allocation returns a unique, stride-separated pointer.
    Distinct,
}

impl SentinelMode {
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Off)
    }
}

impl TryFrom<u8> for SentinelMode {
    type Error = GraphError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Off),
            1 => Ok(Self::Shared),
            2 => Ok(Self::Distinct),
            other => Err(GraphError::misuse(format!(
                "sentinel mode must be 0, 1 or 2, got {other}"
            ))),
        }
    }
}

/// Where an unresolved-looking kernel word actually points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentinelHit {
    pub alloc_index: usize,
    pub offset: usize,
}

impl SentinelHit {
    /// Rebase onto the buffers chosen for a replay.
    pub fn resolve(&self, actual: &[DevicePtr]) -> DevicePtr {
        actual[self.alloc_index] + self.offset as DevicePtr
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentinelLayout {
    /// Non-null so that kernels' null checks pass.
    pub base: DevicePtr,
    /// Power of two, large enough that kernels pick their widest vectorized path.
    pub stride: DevicePtr,
}

impl Default for SentinelLayout {
    fn default() -> Self {
        Self {
            base: 2048,
            stride: 1024,
        }
    }
}

impl SentinelLayout {
    pub fn pointer(&self, mode: SentinelMode, alloc_index: usize) -> DevicePtr {
        match mode {
            SentinelMode::Distinct => self.base + self.stride * (1 + alloc_index as DevicePtr),
            SentinelMode::Off | SentinelMode::Shared => self.base,
        }
    }

    /// Reverse-engineer a word pair seen in a shared (`shared`) and distinct
    /// (`distinct`) capture into an allocation index and byte offset.
    pub fn classify(
        &self,
        shared: u64,
        distinct: u64,
        schema: &[usize],
    ) -> Option<SentinelHit> {
        let delta = distinct.wrapping_sub(shared) as i64;
        if delta % self.stride as i64 != 0 {
            tracing::debug!(
                delta,
                stride = self.stride,
                "word pair is not stride-separated, not a sentinel pointer"
            );
            return None;
        }
        let alloc_index = delta / self.stride as i64 - 1;
        if alloc_index < 0 || alloc_index >= schema.len() as i64 {
            tracing::debug!(
                alloc_index,
                allocations = schema.len(),
                "stride multiple does not name a recorded allocation"
            );
            return None;
        }
        let alloc_index = alloc_index as usize;
        let offset = shared.wrapping_sub(self.base) as i64;
        if offset < 0 || offset >= schema[alloc_index] as i64 {
            tracing::debug!(
                offset,
                size = schema[alloc_index],
                "offset falls outside allocation {alloc_index}"
            );
            return None;
        }
        Some(SentinelHit {
            alloc_index,
            offset: offset as usize,
        })
    }
}
