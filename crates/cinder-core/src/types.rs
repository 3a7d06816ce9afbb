//! # Cinder Core Types
//!
//! Fence values, queue types and descriptor handles used across the
//! lifecycle crates.

use core::fmt;
use core::ops::{Index, IndexMut};

// =============================================================================
// FENCE VALUE
// =============================================================================

/// Per-queue monotonically increasing fence counter.
///
/// A value `V` is *reached* once the queue's completed counter is `>= V`.
/// Zero is never signaled for a real batch, so it doubles as "not used".
pub type FenceValue = u64;

// =============================================================================
// QUEUE TYPE
// =============================================================================

/// Independent command-submission timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QueueType {
    /// Graphics/direct queue
    Graphics = 0,
    /// Async compute queue
    Compute = 1,
    /// Copy engine queue
    Copy = 2,
}

impl QueueType {
    /// Number of queue types
    pub const COUNT: usize = 3;

    /// All queue types in index order
    pub const ALL: [QueueType; Self::COUNT] =
        [QueueType::Graphics, QueueType::Compute, QueueType::Copy];

    /// Array index of this queue type
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

bitflags::bitflags! {
    /// Set of queue types
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueMask: u32 {
        /// Graphics queue
        const GRAPHICS = 1 << 0;
        /// Compute queue
        const COMPUTE = 1 << 1;
        /// Copy queue
        const COPY = 1 << 2;
    }
}

impl QueueMask {
    /// Whether the mask contains `queue`
    pub const fn has(self, queue: QueueType) -> bool {
        self.bits() & (1 << queue.index()) != 0
    }
}

impl From<QueueType> for QueueMask {
    fn from(queue: QueueType) -> Self {
        QueueMask::from_bits_truncate(1 << queue.index())
    }
}

// =============================================================================
// QUEUE MAP
// =============================================================================

/// Fixed-size per-queue storage indexed by [`QueueType`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueMap<T>([T; QueueType::COUNT]);

impl<T> QueueMap<T> {
    /// Create from a per-queue array
    pub const fn from_array(values: [T; QueueType::COUNT]) -> Self {
        Self(values)
    }

    /// Build each entry from its queue type
    pub fn from_fn(mut f: impl FnMut(QueueType) -> T) -> Self {
        Self(QueueType::ALL.map(&mut f))
    }

    /// Iterate `(queue, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (QueueType, &T)> {
        QueueType::ALL.into_iter().zip(self.0.iter())
    }
}

impl<T> Index<QueueType> for QueueMap<T> {
    type Output = T;

    #[inline]
    fn index(&self, queue: QueueType) -> &T {
        &self.0[queue.index()]
    }
}

impl<T> IndexMut<QueueType> for QueueMap<T> {
    #[inline]
    fn index_mut(&mut self, queue: QueueType) -> &mut T {
        &mut self.0[queue.index()]
    }
}

/// Per-queue fence values (last referencing batch per queue)
pub type QueueFences = QueueMap<FenceValue>;

impl QueueFences {
    /// Fences with only `queue` recorded
    pub fn single(queue: QueueType, value: FenceValue) -> Self {
        let mut fences = Self::default();
        fences[queue] = value;
        fences
    }

    /// True when no queue recorded a use
    pub fn is_unused(&self) -> bool {
        self.0.iter().all(|&v| v == 0)
    }

    /// Queues with a nonzero recorded value
    pub fn used_queues(&self) -> QueueMask {
        self.iter()
            .filter(|(_, &v)| v != 0)
            .fold(QueueMask::empty(), |mask, (q, _)| mask | QueueMask::from(q))
    }

    /// Per-queue maximum of two fence sets
    pub fn merge(&mut self, other: &QueueFences) {
        for q in QueueType::ALL {
            self[q] = self[q].max(other[q]);
        }
    }
}

// =============================================================================
// DESCRIPTOR HANDLES
// =============================================================================

/// CPU descriptor handle
///
/// The address of one descriptor slot in a CPU-visible heap. It is an
/// opaque token, never dereferenced by Cinder.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct CpuDescriptorHandle(u64);

impl CpuDescriptorHandle {
    /// Create from a raw value
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Handle `slot` descriptors past this one
    #[inline]
    pub const fn offset(self, slot: u32, stride: u32) -> Self {
        Self(self.0 + slot as u64 * stride as u64)
    }
}

impl fmt::Debug for CpuDescriptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuDescriptorHandle(0x{:016x})", self.0)
    }
}

/// GPU descriptor handle (shader-visible heaps only)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuDescriptorHandle(u64);

impl GpuDescriptorHandle {
    /// Create from a raw value
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Handle `slot` descriptors past this one
    #[inline]
    pub const fn offset(self, slot: u32, stride: u32) -> Self {
        Self(self.0 + slot as u64 * stride as u64)
    }
}

impl fmt::Debug for GpuDescriptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuDescriptorHandle(0x{:016x})", self.0)
    }
}

// =============================================================================
// DESCRIPTOR HEAPS
// =============================================================================

/// Descriptor heap type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    /// Constant buffer / shader resource / unordered access views
    CbvSrvUav,
    /// Samplers
    Sampler,
    /// Render target views
    Rtv,
    /// Depth stencil views
    Dsv,
}

impl DescriptorHeapKind {
    /// Number of heap kinds
    pub const COUNT: usize = 4;

    /// All heap kinds in index order
    pub const ALL: [DescriptorHeapKind; Self::COUNT] = [
        DescriptorHeapKind::CbvSrvUav,
        DescriptorHeapKind::Sampler,
        DescriptorHeapKind::Rtv,
        DescriptorHeapKind::Dsv,
    ];

    /// Array index of this kind
    pub const fn index(self) -> usize {
        match self {
            Self::CbvSrvUav => 0,
            Self::Sampler => 1,
            Self::Rtv => 2,
            Self::Dsv => 3,
        }
    }

    /// Whether heaps of this kind may be shader visible
    pub const fn can_be_shader_visible(self) -> bool {
        matches!(self, Self::CbvSrvUav | Self::Sampler)
    }
}

/// Descriptor heap creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    /// Heap type
    pub kind: DescriptorHeapKind,
    /// Number of descriptor slots
    pub num_descriptors: u32,
    /// Whether shaders can reference the heap directly
    pub shader_visible: bool,
}

impl DescriptorHeapDesc {
    /// CPU-only heap
    pub const fn cpu(kind: DescriptorHeapKind, num_descriptors: u32) -> Self {
        Self {
            kind,
            num_descriptors,
            shader_visible: false,
        }
    }

    /// Shader-visible heap
    pub const fn shader_visible(kind: DescriptorHeapKind, num_descriptors: u32) -> Self {
        Self {
            kind,
            num_descriptors,
            shader_visible: true,
        }
    }
}

// =============================================================================
// BUFFER HEAPS
// =============================================================================

/// CPU-visible heap type for transient buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferHeap {
    /// CPU write, GPU read
    Upload,
    /// GPU write, CPU read
    Readback,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_map_indexing() {
        let mut map = QueueMap::from_fn(|q| q.index() as u64 * 10);
        assert_eq!(map[QueueType::Compute], 10);
        map[QueueType::Copy] = 7;
        assert_eq!(map[QueueType::Copy], 7);
        assert_eq!(map.iter().count(), QueueType::COUNT);
    }

    #[test]
    fn test_queue_fences() {
        let mut fences = QueueFences::single(QueueType::Graphics, 5);
        assert!(!fences.is_unused());
        assert_eq!(fences.used_queues(), QueueMask::GRAPHICS);

        fences.merge(&QueueFences::single(QueueType::Copy, 3));
        assert_eq!(fences.used_queues(), QueueMask::GRAPHICS | QueueMask::COPY);
        assert!(QueueFences::default().is_unused());
    }

    #[test]
    fn test_queue_mask() {
        let mask = QueueMask::from(QueueType::Compute);
        assert!(mask.has(QueueType::Compute));
        assert!(!mask.has(QueueType::Graphics));
    }

    #[test]
    fn test_descriptor_handle_arithmetic() {
        let base = CpuDescriptorHandle::new(0x1000);
        assert_eq!(base.offset(3, 32).raw(), 0x1000 + 96);
        let gpu = GpuDescriptorHandle::new(0x8000);
        assert_eq!(gpu.offset(0, 32), gpu);
    }
}
