//! # Cinder Core Traits
//!
//! The seams between the lifecycle subsystem and its environment.
//!
//! ```text
//! GpuDevice
//!    │
//!    ├── DescriptorHeapSource ── DescriptorHeap
//!    │
//!    ├── MemorySource ── backing heaps for suballocation
//!    │
//!    └── fence queries (completed value, blocking wait)
//!
//! FenceTimeline  (implemented by the orchestrator)
//! ```

use crate::error::Result;
use crate::types::*;

// =============================================================================
// FENCE TIMELINE
// =============================================================================

/// Per-queue view of submission progress
pub trait FenceTimeline {
    /// Highest fence value the GPU has completed on `queue`
    fn completed_fence(&self, queue: QueueType) -> FenceValue;

    /// Fence value of the batch currently being recorded on `queue`
    ///
    /// Every batch with a lower value has been submitted.
    fn recording_fence(&self, queue: QueueType) -> FenceValue;

    /// Check if `value` has been reached on `queue`
    fn is_fence_reached(&self, queue: QueueType, value: FenceValue) -> bool {
        self.completed_fence(queue) >= value
    }
}

// =============================================================================
// DESCRIPTOR HEAPS
// =============================================================================

/// A device descriptor heap object
pub trait DescriptorHeap: Send {
    /// Handle of slot zero
    fn cpu_start(&self) -> CpuDescriptorHandle;

    /// GPU handle of slot zero, for shader-visible heaps
    fn gpu_start(&self) -> Option<GpuDescriptorHandle>;
}

/// Creates descriptor heaps
pub trait DescriptorHeapSource: Send + Sync {
    /// Heap object type
    type Heap: DescriptorHeap + 'static;

    /// Create a heap described by `desc`
    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<Self::Heap>;

    /// Byte distance between consecutive slots of `kind`
    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32;
}

// =============================================================================
// MEMORY
// =============================================================================

/// Creates device memory heaps that suballocators carve blocks out of
pub trait MemorySource: Send + Sync {
    /// Memory heap object type, released on drop
    type Memory: Send + Sync + 'static;

    /// Create a heap of `size` bytes on `heap`
    ///
    /// Fails with [`Error::OutOfDeviceMemory`](crate::Error::OutOfDeviceMemory)
    /// when the device cannot back it.
    fn create_memory_heap(&self, heap: BufferHeap, size: u64) -> Result<Self::Memory>;
}

// =============================================================================
// GPU DEVICE
// =============================================================================

/// The device the lifecycle subsystem allocates from
pub trait GpuDevice: DescriptorHeapSource + MemorySource + 'static {
    /// Transient buffer object type
    type Buffer: Send + 'static;

    /// Create a CPU-visible buffer of `size` bytes
    fn create_buffer(&self, heap: BufferHeap, size: u64) -> Result<Self::Buffer>;

    /// Read the completed fence value of `queue` from the device
    fn query_completed_fence(&self, queue: QueueType) -> FenceValue;

    /// Block until `queue` reaches `value`
    ///
    /// Fails with [`Error::DeviceLost`](crate::Error::DeviceLost) if the
    /// fence can never be signaled.
    fn wait_for_fence(&self, queue: QueueType, value: FenceValue) -> Result<()>;
}
