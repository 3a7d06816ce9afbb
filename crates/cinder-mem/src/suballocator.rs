//! # Suballocators
//!
//! Strategies for carving transient buffer memory into blocks.
//!
//! - [`BuddySuballocator`]: power-of-two blocks out of a large address range,
//!   backed by fixed-size device heaps created on first use and released
//!   once they hold no block
//! - [`DirectAllocator`]: a dedicated device heap for every block
//!
//! The strategy is picked once by [`select_suballocator`]; callers only see
//! the [`Suballocator`] trait.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use cinder_core::{BufferHeap, Error, MemorySource, Result};

/// Requests larger than this get their own allocation
pub const BUDDY_ALLOCATOR_THRESHOLD: u64 = 64 * 1024;

/// Check if a request must bypass suballocation
pub const fn needs_own_allocation(size: u64, threshold: u64, cannot_be_offset: bool) -> bool {
    size > threshold || cannot_be_offset
}

// =============================================================================
// BLOCKS AND TRAIT
// =============================================================================

/// A block handed out by a suballocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuballocationBlock {
    /// Byte offset in the backing heap
    pub offset: u64,
    /// Block size in bytes
    pub size: u64,
    /// Backing heap identifier
    pub heap_id: u32,
}

impl SuballocationBlock {
    /// One past the last byte
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Uniform interface over suballocation strategies
pub trait Suballocator: Send + Sync {
    /// Allocate a block of at least `size` bytes
    fn allocate(&self, size: u64) -> Result<SuballocationBlock>;

    /// Release a block this allocator returned
    fn deallocate(&self, block: SuballocationBlock);

    /// Bytes currently allocated
    fn allocated_bytes(&self) -> u64;

    /// Blocks currently allocated
    fn allocation_count(&self) -> usize;

    /// Device heaps currently backing live blocks
    fn backing_heaps(&self) -> usize;
}

/// Buddy suballocator layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyConfig {
    /// Bytes of address range managed
    pub capacity: u64,
    /// Smallest block handed out
    pub min_block_size: u64,
    /// Bytes per backing device heap, also the largest block
    pub heap_size: u64,
}

impl BuddyConfig {
    /// Layout over `capacity` bytes
    pub const fn new(capacity: u64, min_block_size: u64, heap_size: u64) -> Self {
        Self {
            capacity,
            min_block_size,
            heap_size,
        }
    }
}

/// Pick the strategy used for `heap`
///
/// With `use_buddy` blocks are suballocated as laid out by `buddy`; otherwise
/// every block is its own device heap.
pub fn select_suballocator<S: MemorySource + 'static>(
    source: Arc<S>,
    heap: BufferHeap,
    use_buddy: bool,
    buddy: BuddyConfig,
) -> Result<Arc<dyn Suballocator>> {
    if use_buddy {
        log::debug!(
            "select_suballocator: {:?} buddy over {} bytes, {} byte blocks, {} byte heaps",
            heap,
            buddy.capacity,
            buddy.min_block_size,
            buddy.heap_size
        );
        Ok(Arc::new(BuddySuballocator::new(source, heap, buddy)?))
    } else {
        log::debug!("select_suballocator: {:?} direct allocation", heap);
        Ok(Arc::new(DirectAllocator::new(source, heap)))
    }
}

// =============================================================================
// BUDDY SUBALLOCATOR
// =============================================================================

type Order = u32;

struct Backing<M> {
    _memory: M,
    blocks: usize,
}

struct BuddyState<M> {
    free_lists: Vec<Vec<u64>>,
    allocations: BTreeMap<u64, Order>,
    used: u64,
    backing: BTreeMap<u32, Backing<M>>,
}

/// Thread-safe buddy allocator over an address range of device heaps
///
/// The range is split into heaps of [`BuddyConfig::heap_size`] bytes. A
/// block never straddles two heaps; its `heap_id` is the heap index and its
/// offset is relative to that heap.
pub struct BuddySuballocator<S: MemorySource> {
    source: Arc<S>,
    heap: BufferHeap,
    size: u64,
    min_block_size: u64,
    heap_size: u64,
    heap_count: u32,
    max_order: Order,
    state: spin::Mutex<BuddyState<S::Memory>>,
}

impl<S: MemorySource> BuddySuballocator<S> {
    /// Create a buddy allocator laid out by `config`
    ///
    /// All sizes are rounded up to powers of two. No device memory is
    /// requested until the first allocation.
    pub fn new(source: Arc<S>, heap: BufferHeap, config: BuddyConfig) -> Result<Self> {
        let BuddyConfig {
            capacity,
            min_block_size,
            heap_size,
        } = config;
        if min_block_size == 0 || min_block_size > heap_size || heap_size > capacity {
            return Err(Error::InvalidParameter);
        }

        let size = capacity.checked_next_power_of_two().ok_or(Error::InvalidParameter)?;
        let min_block_size = min_block_size.next_power_of_two();
        let heap_size = heap_size.checked_next_power_of_two().ok_or(Error::InvalidParameter)?;
        let heap_count = u32::try_from(size / heap_size).map_err(|_| Error::InvalidParameter)?;
        let max_order = (size / min_block_size).trailing_zeros();

        let mut free_lists = vec![Vec::new(); max_order as usize + 1];
        free_lists[max_order as usize].push(0);

        Ok(Self {
            source,
            heap,
            size,
            min_block_size,
            heap_size,
            heap_count,
            max_order,
            state: spin::Mutex::new(BuddyState {
                free_lists,
                allocations: BTreeMap::new(),
                used: 0,
                backing: BTreeMap::new(),
            }),
        })
    }

    /// Total managed bytes
    pub fn capacity(&self) -> u64 {
        self.size
    }

    /// Bytes per backing heap
    pub fn heap_size(&self) -> u64 {
        self.heap_size
    }

    /// Bytes not allocated
    pub fn available(&self) -> u64 {
        self.size - self.state.lock().used
    }

    fn size_to_order(&self, size: u64) -> Order {
        let blocks = size.div_ceil(self.min_block_size);
        blocks.next_power_of_two().trailing_zeros()
    }

    fn order_to_size(&self, order: Order) -> u64 {
        self.min_block_size << order
    }

    fn split_block(&self, state: &mut BuddyState<S::Memory>, offset: u64, from: Order, to: Order) {
        let mut order = from;
        while order > to {
            order -= 1;
            state.free_lists[order as usize].push(offset + self.order_to_size(order));
        }
    }

    fn merge_with_buddy(&self, state: &mut BuddyState<S::Memory>, offset: u64, order: Order) {
        let mut offset = offset;
        let mut order = order;

        while order < self.max_order {
            let buddy = offset ^ self.order_to_size(order);
            let list = &mut state.free_lists[order as usize];
            match list.iter().position(|&o| o == buddy) {
                Some(pos) => {
                    list.swap_remove(pos);
                    offset = offset.min(buddy);
                    order += 1;
                }
                None => break,
            }
        }

        state.free_lists[order as usize].push(offset);
    }

    fn release_block(&self, state: &mut BuddyState<S::Memory>, offset: u64, order: Order) {
        state.used -= self.order_to_size(order);
        self.merge_with_buddy(state, offset, order);
    }
}

impl<S: MemorySource> Suballocator for BuddySuballocator<S> {
    fn allocate(&self, size: u64) -> Result<SuballocationBlock> {
        if size > self.heap_size {
            return Err(Error::InvalidParameter);
        }

        let order = self.size_to_order(size.max(1));
        let block_size = self.order_to_size(order);

        let offset = {
            let mut state = self.state.lock();
            let block_order = (order..=self.max_order)
                .find(|&o| !state.free_lists[o as usize].is_empty())
                .ok_or(Error::OutOfDeviceMemory)?;
            let offset = state.free_lists[block_order as usize]
                .pop()
                .ok_or(Error::OutOfDeviceMemory)?;

            self.split_block(&mut state, offset, block_order, order);
            state.allocations.insert(offset, order);
            state.used += block_size;

            let heap_id = (offset / self.heap_size) as u32;
            if let Some(backing) = state.backing.get_mut(&heap_id) {
                backing.blocks += 1;
                return Ok(SuballocationBlock {
                    offset: offset % self.heap_size,
                    size: block_size,
                    heap_id,
                });
            }
            offset
        };

        // first block in this heap, create its memory outside the lock
        let heap_id = (offset / self.heap_size) as u32;
        let memory = self.source.create_memory_heap(self.heap, self.heap_size);

        let mut state = self.state.lock();
        let spare = match memory {
            Ok(memory) => match state.backing.get_mut(&heap_id) {
                Some(backing) => {
                    backing.blocks += 1;
                    Some(memory)
                }
                None => {
                    state.backing.insert(heap_id, Backing { _memory: memory, blocks: 1 });
                    log::trace!("BuddySuballocator: backed {:?} heap {}", self.heap, heap_id);
                    None
                }
            },
            Err(err) => {
                state.allocations.remove(&offset);
                self.release_block(&mut state, offset, order);
                return Err(err);
            }
        };
        drop(state);
        drop(spare);

        Ok(SuballocationBlock {
            offset: offset % self.heap_size,
            size: block_size,
            heap_id,
        })
    }

    fn deallocate(&self, block: SuballocationBlock) {
        if block.heap_id >= self.heap_count || block.offset >= self.heap_size {
            log::error!(
                "BuddySuballocator: block {:?} is outside the {:?} range",
                block,
                self.heap
            );
            return;
        }
        let offset = block.heap_id as u64 * self.heap_size + block.offset;

        let mut state = self.state.lock();
        let Some(order) = state.allocations.remove(&offset) else {
            log::error!("BuddySuballocator: unknown block at offset {:#x}", offset);
            return;
        };
        self.release_block(&mut state, offset, order);

        let mut released = None;
        if let Some(backing) = state.backing.get_mut(&block.heap_id) {
            backing.blocks -= 1;
            if backing.blocks == 0 {
                released = state.backing.remove(&block.heap_id);
            }
        }
        drop(state);

        if released.is_some() {
            log::trace!("BuddySuballocator: released {:?} heap {}", self.heap, block.heap_id);
        }
    }

    fn allocated_bytes(&self) -> u64 {
        self.state.lock().used
    }

    fn allocation_count(&self) -> usize {
        self.state.lock().allocations.len()
    }

    fn backing_heaps(&self) -> usize {
        self.state.lock().backing.len()
    }
}

impl<S: MemorySource> fmt::Debug for BuddySuballocator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddySuballocator")
            .field("heap", &self.heap)
            .field("size", &self.size)
            .field("min_block_size", &self.min_block_size)
            .field("heap_size", &self.heap_size)
            .field("used", &self.allocated_bytes())
            .field("backing_heaps", &self.backing_heaps())
            .finish()
    }
}

// =============================================================================
// DIRECT ALLOCATOR
// =============================================================================

struct Dedicated<M> {
    _memory: M,
    size: u64,
}

struct DirectState<M> {
    next_heap_id: u32,
    live: BTreeMap<u32, Dedicated<M>>,
    used: u64,
}

/// One dedicated device heap per block
///
/// Every block starts at offset 0 of a heap of its own. Heap ids start at 1.
pub struct DirectAllocator<S: MemorySource> {
    source: Arc<S>,
    heap: BufferHeap,
    state: spin::Mutex<DirectState<S::Memory>>,
}

impl<S: MemorySource> DirectAllocator<S> {
    /// Create an allocator of `heap` memory with no live heaps
    pub fn new(source: Arc<S>, heap: BufferHeap) -> Self {
        Self {
            source,
            heap,
            state: spin::Mutex::new(DirectState {
                next_heap_id: 0,
                live: BTreeMap::new(),
                used: 0,
            }),
        }
    }
}

impl<S: MemorySource> Suballocator for DirectAllocator<S> {
    fn allocate(&self, size: u64) -> Result<SuballocationBlock> {
        if size == 0 {
            return Err(Error::InvalidParameter);
        }

        let memory = self.source.create_memory_heap(self.heap, size)?;

        let mut state = self.state.lock();
        let used = state.used.checked_add(size).ok_or(Error::AllocationFailed)?;
        let heap_id = state.next_heap_id.checked_add(1).ok_or(Error::AllocationFailed)?;
        state.next_heap_id = heap_id;
        state.used = used;
        state.live.insert(heap_id, Dedicated { _memory: memory, size });

        Ok(SuballocationBlock {
            offset: 0,
            size,
            heap_id,
        })
    }

    fn deallocate(&self, block: SuballocationBlock) {
        let mut state = self.state.lock();
        let Some(dedicated) = state.live.remove(&block.heap_id) else {
            log::error!("DirectAllocator: unknown heap {}", block.heap_id);
            return;
        };
        state.used -= dedicated.size;
        drop(state);
        drop(dedicated);
    }

    fn allocated_bytes(&self) -> u64 {
        self.state.lock().used
    }

    fn allocation_count(&self) -> usize {
        self.state.lock().live.len()
    }

    fn backing_heaps(&self) -> usize {
        self.allocation_count()
    }
}

impl<S: MemorySource> fmt::Debug for DirectAllocator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectAllocator")
            .field("heap", &self.heap)
            .field("live", &self.allocation_count())
            .field("used", &self.allocated_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct TestMemory(Arc<AtomicUsize>);

    impl Drop for TestMemory {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::Relaxed);
        }
    }

    #[derive(Default)]
    struct TestSource {
        live: Arc<AtomicUsize>,
        created: AtomicUsize,
        fail: AtomicBool,
    }

    impl TestSource {
        fn live(&self) -> usize {
            self.live.load(Ordering::Relaxed)
        }
    }

    impl MemorySource for TestSource {
        type Memory = TestMemory;

        fn create_memory_heap(&self, _heap: BufferHeap, _size: u64) -> Result<TestMemory> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(Error::OutOfDeviceMemory);
            }
            self.created.fetch_add(1, Ordering::Relaxed);
            self.live.fetch_add(1, Ordering::Relaxed);
            Ok(TestMemory(self.live.clone()))
        }
    }

    static_assertions::assert_impl_all!(BuddySuballocator<TestSource>: Send, Sync);
    static_assertions::assert_impl_all!(DirectAllocator<TestSource>: Send, Sync);

    fn buddy(
        capacity: u64,
        min: u64,
        heap_size: u64,
    ) -> (Arc<TestSource>, BuddySuballocator<TestSource>) {
        let source = Arc::new(TestSource::default());
        let config = BuddyConfig::new(capacity, min, heap_size);
        let buddy = BuddySuballocator::new(source.clone(), BufferHeap::Upload, config).unwrap();
        (source, buddy)
    }

    fn direct() -> (Arc<TestSource>, DirectAllocator<TestSource>) {
        let source = Arc::new(TestSource::default());
        (source.clone(), DirectAllocator::new(source, BufferHeap::Readback))
    }

    #[test]
    fn test_buddy_split_and_merge() {
        let (source, buddy) = buddy(1024, 64, 1024);
        assert_eq!(source.live(), 0);

        let a = buddy.allocate(64).unwrap();
        let b = buddy.allocate(100).unwrap();
        assert_eq!((a.heap_id, b.heap_id), (0, 0));
        assert_eq!(b.size, 128);
        assert!(a.end() <= b.offset || b.end() <= a.offset);
        assert_eq!(buddy.allocated_bytes(), 192);
        assert_eq!(source.live(), 1);

        buddy.deallocate(a);
        buddy.deallocate(b);
        assert_eq!(buddy.allocation_count(), 0);
        assert_eq!(source.live(), 0);
        // everything merged back into one block
        assert_eq!(buddy.allocate(1024).unwrap().offset, 0);
    }

    #[test]
    fn test_buddy_backs_heaps_on_demand() {
        let (source, buddy) = buddy(4096, 256, 1024);
        let first = buddy.allocate(1024).unwrap();
        let second = buddy.allocate(1024).unwrap();
        assert_eq!((first.heap_id, first.offset), (0, 0));
        assert_eq!((second.heap_id, second.offset), (1, 0));
        assert_eq!(buddy.backing_heaps(), 2);

        let small = buddy.allocate(200).unwrap();
        assert!(small.end() <= buddy.heap_size());
        assert_eq!(source.created.load(Ordering::Relaxed), 3);

        buddy.deallocate(first);
        assert_eq!(buddy.backing_heaps(), 2);
        assert_eq!(source.live(), 2);
    }

    #[test]
    fn test_buddy_exhaustion() {
        let (_source, buddy) = buddy(256, 64, 256);
        let blocks: Vec<_> = (0..4).map(|_| buddy.allocate(64).unwrap()).collect();
        assert_eq!(buddy.allocate(1), Err(Error::OutOfDeviceMemory));
        assert_eq!(buddy.allocate(512), Err(Error::InvalidParameter));

        buddy.deallocate(blocks[2]);
        assert_eq!(buddy.allocate(64).unwrap().offset, blocks[2].offset);
    }

    #[test]
    fn test_buddy_heap_creation_failure_rolls_back() {
        let (source, buddy) = buddy(1024, 64, 1024);
        source.fail.store(true, Ordering::Relaxed);
        assert_eq!(buddy.allocate(64), Err(Error::OutOfDeviceMemory));
        assert_eq!(buddy.allocation_count(), 0);
        assert_eq!(buddy.allocated_bytes(), 0);
        assert_eq!(buddy.backing_heaps(), 0);

        source.fail.store(false, Ordering::Relaxed);
        assert_eq!(buddy.allocate(1024).unwrap().offset, 0);
    }

    #[test]
    fn test_buddy_ignores_foreign_blocks() {
        let (_source, buddy) = buddy(256, 64, 256);
        let a = buddy.allocate(64).unwrap();
        buddy.deallocate(SuballocationBlock { heap_id: 2, ..a });
        buddy.deallocate(SuballocationBlock { offset: 128, ..a });
        assert_eq!(buddy.allocation_count(), 1);

        let source = Arc::new(TestSource::default());
        let empty = BuddyConfig::new(0, 64, 64);
        assert!(BuddySuballocator::new(source.clone(), BufferHeap::Upload, empty).is_err());
        let oversized_heap = BuddyConfig::new(256, 64, 512);
        assert!(BuddySuballocator::new(source, BufferHeap::Upload, oversized_heap).is_err());
    }

    #[test]
    fn test_direct_allocations_are_dedicated() {
        let (source, direct) = direct();
        let a = direct.allocate(300).unwrap();
        let b = direct.allocate(300).unwrap();
        assert_eq!((a.offset, b.offset), (0, 0));
        assert_ne!(a.heap_id, b.heap_id);
        assert_eq!(direct.allocated_bytes(), 600);
        assert_eq!(source.live(), 2);

        direct.deallocate(a);
        direct.deallocate(a);
        assert_eq!(direct.allocation_count(), 1);
        assert_eq!(source.live(), 1);
    }

    #[test]
    fn test_direct_surfaces_device_failure() {
        let (source, direct) = direct();
        source.fail.store(true, Ordering::Relaxed);
        assert_eq!(direct.allocate(4096), Err(Error::OutOfDeviceMemory));
        assert_eq!(direct.allocation_count(), 0);
        assert_eq!(direct.allocate(0), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_direct_byte_count_overflow() {
        let (source, direct) = direct();
        let half = u64::MAX / 2 + 1;
        assert_eq!(direct.allocate(half).unwrap().size, half);
        assert_eq!(direct.allocate(half), Err(Error::AllocationFailed));
        assert_eq!(direct.allocated_bytes(), half);
        assert_eq!(direct.allocation_count(), 1);
        assert_eq!(source.live(), 1);
    }

    #[test]
    fn test_select_and_threshold() {
        let source = Arc::new(TestSource::default());
        let config = BuddyConfig::new(1 << 20, 256, BUDDY_ALLOCATOR_THRESHOLD);
        let buddy = select_suballocator(source.clone(), BufferHeap::Upload, true, config).unwrap();
        assert_eq!(buddy.allocate(10).unwrap().size, 256);
        let direct = select_suballocator(source, BufferHeap::Upload, false, config).unwrap();
        assert_eq!(direct.allocate(10).unwrap().size, 10);

        let threshold = BUDDY_ALLOCATOR_THRESHOLD;
        assert!(!needs_own_allocation(threshold, threshold, false));
        assert!(needs_own_allocation(threshold + 1, threshold, false));
        assert!(needs_own_allocation(1, threshold, true));
    }

    #[test]
    fn test_buddy_shared_between_threads() {
        let (source, buddy) = buddy(64 * 256, 256, 1024);
        let buddy = Arc::new(buddy);
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let buddy = Arc::clone(&buddy);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let block = buddy.allocate(256).unwrap();
                        buddy.deallocate(block);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(buddy.allocation_count(), 0);
        assert_eq!(buddy.backing_heaps(), 0);
        assert_eq!(source.live(), 0);
    }
}
