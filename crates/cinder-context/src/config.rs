//! Context configuration.

use cinder_mem::{BUDDY_ALLOCATOR_THRESHOLD, DEFAULT_LEDGER_CAPACITY};

/// Default number of fences a pooled buffer may sit unused before eviction
pub const DEFAULT_BUFFER_POOL_TRIM_THRESHOLD: u64 = 100;

/// Shader-visible descriptor heap configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnlineHeapConfig {
    /// Slots in the first heap
    pub initial_size: u32,
    /// Largest heap a roll-over may create
    pub max_size: u32,
    /// Retired heaps in flight before a roll-over waits on the GPU
    pub pool_depth: usize,
    /// Waves tracked by the slot ring
    pub ledger_capacity: u32,
}

impl OnlineHeapConfig {
    /// View (CBV/SRV/UAV) heap starting small and growing up to one million slots
    pub const fn view_heap() -> Self {
        Self {
            initial_size: 4096,
            max_size: 1_000_000,
            pool_depth: 3,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
        }
    }

    /// Sampler heap, fixed at 2048 slots
    pub const fn sampler_heap() -> Self {
        Self {
            initial_size: 2048,
            max_size: 2048,
            pool_depth: 3,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
        }
    }

    /// Fixed-size heap of `size` slots
    pub const fn fixed(size: u32) -> Self {
        Self {
            initial_size: size,
            max_size: size,
            pool_depth: 3,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
        }
    }
}

/// Context configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextConfig {
    /// Fence distance after which an idle pooled buffer is evicted
    pub buffer_pool_trim_threshold: u64,
    /// Slots per CPU-only descriptor heap
    pub cpu_descriptors_per_heap: u32,
    /// Online view heap
    pub view_heap: OnlineHeapConfig,
    /// Online sampler heap
    pub sampler_heap: OnlineHeapConfig,
    /// Suballocate small buffers out of a buddy heap
    pub use_buddy_suballocation: bool,
    /// Requests above this size get their own allocation
    ///
    /// Rounded up to a power of two, it is also the size of each device heap
    /// backing the buddy suballocator.
    pub buddy_threshold: u64,
    /// Address range of each buddy suballocator, backed one heap at a time
    pub buddy_capacity: u64,
    /// Smallest buddy block
    pub buddy_min_block_size: u64,
}

impl ContextConfig {
    /// Small heaps and pools, for tests and constrained devices
    pub const fn minimal() -> Self {
        Self {
            buffer_pool_trim_threshold: DEFAULT_BUFFER_POOL_TRIM_THRESHOLD,
            cpu_descriptors_per_heap: 64,
            view_heap: OnlineHeapConfig {
                initial_size: 64,
                max_size: 256,
                pool_depth: 2,
                ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            },
            sampler_heap: OnlineHeapConfig::fixed(64),
            use_buddy_suballocation: true,
            buddy_threshold: BUDDY_ALLOCATOR_THRESHOLD,
            buddy_capacity: 16 * 1024 * 1024,
            buddy_min_block_size: 256,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            buffer_pool_trim_threshold: DEFAULT_BUFFER_POOL_TRIM_THRESHOLD,
            cpu_descriptors_per_heap: 1024,
            view_heap: OnlineHeapConfig::view_heap(),
            sampler_heap: OnlineHeapConfig::sampler_heap(),
            use_buddy_suballocation: true,
            buddy_threshold: BUDDY_ALLOCATOR_THRESHOLD,
            buddy_capacity: 32 * 1024 * 1024 * 1024,
            buddy_min_block_size: 256,
        }
    }
}
