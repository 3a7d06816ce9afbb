//! # Cinder Memory
//!
//! Fence-gated recycling and slot allocation for GPU resources.
//!
//! ## Components
//!
//! - **Fence pools**: FIFO recycling of resources once their fence completes
//! - **Multi-level pools**: fence pools bucketed by size
//! - **Descriptor heap manager**: single-slot allocation out of CPU heaps
//! - **Fenced ring buffer**: contiguous ranges reclaimed wave by wave
//! - **Suballocators**: buddy and direct block allocation over device heaps
//!
//! ## Threading
//!
//! Pools and the descriptor heap manager take a [`LockPolicy`] parameter.
//! With [`Unlocked`] they are `!Sync`; with [`Locked`] every operation runs
//! under a spin mutex. The ring buffer takes `&mut self` and is never locked.
//!
//! [`LockPolicy`]: cinder_core::LockPolicy
//! [`Unlocked`]: cinder_core::Unlocked
//! [`Locked`]: cinder_core::Locked

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod descriptor_heap;
pub mod fence_pool;
pub mod multi_level;
pub mod ring;
pub mod suballocator;

// Re-exports for convenience
pub use descriptor_heap::{DescriptorHeapManager, FreeRange, HeapIndex};
pub use fence_pool::{BoundedFencePool, FencePool, FenceQueue, PoolEntry};
pub use multi_level::{DynamicBufferPool, MultiLevelPool, DYNAMIC_BUFFER_MULTIPLE};
pub use ring::{FencedRingBuffer, RingConfig, DEFAULT_LEDGER_CAPACITY, MAX_LEDGER_CAPACITY};
pub use suballocator::{
    needs_own_allocation, select_suballocator, BuddyConfig, BuddySuballocator, DirectAllocator,
    SuballocationBlock, Suballocator, BUDDY_ALLOCATOR_THRESHOLD,
};
