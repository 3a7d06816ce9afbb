//! # Descriptor Heap Manager
//!
//! Allocates single descriptor slots out of CPU-only descriptor heaps.
//!
//! Heaps are created on demand and never destroyed, so every CPU handle
//! handed out stays valid for the lifetime of the manager. Each heap keeps a
//! position-ordered list of free byte ranges; a queue of heap indices with
//! free space decides where the next slot comes from.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use cinder_core::{
    CpuDescriptorHandle, DescriptorHeap, DescriptorHeapDesc, DescriptorHeapKind,
    DescriptorHeapSource, Error, LockPolicy, Result, Unlocked,
};

/// Index of a heap within a manager
pub type HeapIndex = u32;

// =============================================================================
// FREE RANGES
// =============================================================================

/// Free `[start, end)` byte range of descriptor handle values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRange {
    /// First free handle value
    pub start: u64,
    /// One past the last free handle value
    pub end: u64,
}

impl FreeRange {
    /// Range size in bytes
    pub const fn len_bytes(&self) -> u64 {
        self.end - self.start
    }
}

struct HeapEntry<H> {
    heap: H,
    free_list: VecDeque<FreeRange>,
}

struct HeapSet<H> {
    heaps: Vec<HeapEntry<H>>,
    free_heaps: VecDeque<HeapIndex>,
}

// =============================================================================
// DESCRIPTOR HEAP MANAGER
// =============================================================================

/// Free-list allocator of descriptor slots across growable heaps
pub struct DescriptorHeapManager<S: DescriptorHeapSource, L: LockPolicy = Unlocked> {
    source: Arc<S>,
    desc: DescriptorHeapDesc,
    increment: u32,
    state: L::Cell<HeapSet<S::Heap>>,
}

impl<S: DescriptorHeapSource, L: LockPolicy> DescriptorHeapManager<S, L> {
    /// Create a manager for `kind` heaps of `descriptors_per_heap` slots
    pub fn new(source: Arc<S>, kind: DescriptorHeapKind, descriptors_per_heap: u32) -> Self {
        let increment = source.descriptor_increment(kind);
        Self {
            source,
            desc: DescriptorHeapDesc::cpu(kind, descriptors_per_heap),
            increment,
            state: L::new_cell(HeapSet {
                heaps: Vec::new(),
                free_heaps: VecDeque::new(),
            }),
        }
    }

    /// Allocate one descriptor slot
    ///
    /// Creates a new heap when no existing heap has a free slot; a failure to
    /// create it is returned to the caller.
    pub fn allocate_heap_slot(&self) -> Result<(CpuDescriptorHandle, HeapIndex)> {
        L::with(&self.state, |set| {
            loop {
                let Some(&index) = set.free_heaps.front() else {
                    self.grow(set)?;
                    continue;
                };

                let entry = &mut set.heaps[index as usize];
                let Some(range) = entry.free_list.front_mut() else {
                    // full heap left in the queue, drop it and look again
                    set.free_heaps.pop_front();
                    continue;
                };

                let handle = CpuDescriptorHandle::new(range.start);
                range.start += self.increment as u64;

                if range.start == range.end {
                    entry.free_list.pop_front();
                    if entry.free_list.is_empty() {
                        set.free_heaps.pop_front();
                    }
                }

                return Ok((handle, index));
            }
        })
    }

    /// Return a slot previously handed out by [`Self::allocate_heap_slot`]
    ///
    /// Adjacent free ranges are merged. Unknown heaps, handles outside the
    /// heap and double frees are logged and ignored. If bookkeeping memory runs
    /// out the slot is leaked.
    pub fn free_heap_slot(&self, handle: CpuDescriptorHandle, index: HeapIndex) {
        let increment = self.increment as u64;
        let heap_bytes = self.desc.num_descriptors as u64 * increment;

        L::with(&self.state, |set| {
            let Some(entry) = set.heaps.get_mut(index as usize) else {
                log::error!("DescriptorHeapManager: free into unknown heap #{}", index);
                return;
            };

            let base = entry.heap.cpu_start().raw();
            let start = handle.raw();
            let end = start + increment;
            if start < base || end > base + heap_bytes || (start - base) % increment != 0 {
                log::error!(
                    "DescriptorHeapManager: {:?} does not belong to heap #{}",
                    handle,
                    index
                );
                return;
            }

            let list = &mut entry.free_list;
            let was_full = list.is_empty();
            let pos = list.partition_point(|range| range.start <= start);

            if pos > 0 && list[pos - 1].end > start {
                log::error!("DescriptorHeapManager: double free of {:?}", handle);
                return;
            }

            if was_full && set.free_heaps.try_reserve(1).is_err() {
                log::warn!("DescriptorHeapManager: out of memory, leaking {:?}", handle);
                return;
            }

            let joins_prev = pos > 0 && list[pos - 1].end == start;
            let joins_next = pos < list.len() && list[pos].start == end;
            match (joins_prev, joins_next) {
                (true, true) => {
                    list[pos - 1].end = list[pos].end;
                    list.remove(pos);
                }
                (true, false) => list[pos - 1].end = end,
                (false, true) => list[pos].start = start,
                (false, false) => {
                    if list.try_reserve(1).is_err() {
                        log::warn!("DescriptorHeapManager: out of memory, leaking {:?}", handle);
                        return;
                    }
                    list.insert(pos, FreeRange { start, end });
                }
            }

            if was_full {
                set.free_heaps.push_back(index);
            }
        });
    }

    /// Create one more heap and queue it as having free slots
    fn grow(&self, set: &mut HeapSet<S::Heap>) -> Result<()> {
        if self.desc.num_descriptors == 0 || self.increment == 0 {
            log::error!(
                "DescriptorHeapManager: cannot lay out {} {:?} slots with stride {}",
                self.desc.num_descriptors,
                self.desc.kind,
                self.increment
            );
            return Err(Error::InvalidParameter);
        }

        let index = HeapIndex::try_from(set.heaps.len()).map_err(|_| Error::OutOfMemory)?;
        set.heaps.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        set.free_heaps.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        let mut free_list = VecDeque::new();
        free_list.try_reserve(1).map_err(|_| Error::OutOfMemory)?;

        let heap = self.source.create_descriptor_heap(&self.desc)?;
        let base = heap.cpu_start().raw();
        free_list.push_back(FreeRange {
            start: base,
            end: base + self.desc.num_descriptors as u64 * self.increment as u64,
        });

        set.heaps.push(HeapEntry { heap, free_list });
        set.free_heaps.push_back(index);

        log::debug!(
            "DescriptorHeapManager: created {:?} heap #{} ({} slots)",
            self.desc.kind,
            index,
            self.desc.num_descriptors
        );
        Ok(())
    }

    /// Number of heaps created so far
    pub fn heap_count(&self) -> usize {
        L::with(&self.state, |set| set.heaps.len())
    }

    /// Free slots remaining in heap `index`
    pub fn free_slot_count(&self, index: HeapIndex) -> Option<u32> {
        let increment = self.increment as u64;
        L::with(&self.state, |set| {
            set.heaps.get(index as usize).map(|entry| {
                let bytes: u64 = entry.free_list.iter().map(FreeRange::len_bytes).sum();
                (bytes / increment) as u32
            })
        })
    }

    /// Snapshot of the free ranges of heap `index`
    pub fn free_ranges(&self, index: HeapIndex) -> Vec<FreeRange> {
        L::with(&self.state, |set| {
            set.heaps
                .get(index as usize)
                .map(|entry| entry.free_list.iter().copied().collect())
                .unwrap_or_default()
        })
    }

    /// Slots per heap
    pub fn descriptors_per_heap(&self) -> u32 {
        self.desc.num_descriptors
    }

    /// Byte stride between slots
    pub fn descriptor_increment(&self) -> u32 {
        self.increment
    }

    /// Heap type served
    pub fn kind(&self) -> DescriptorHeapKind {
        self.desc.kind
    }
}

impl<S: DescriptorHeapSource, L: LockPolicy> fmt::Debug for DescriptorHeapManager<S, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorHeapManager")
            .field("desc", &self.desc)
            .field("increment", &self.increment)
            .field("heaps", &self.heap_count())
            .finish()
    }
}
