//! # Online Descriptor Heaps
//!
//! Shader-visible descriptor heaps handed out in contiguous slot ranges.
//!
//! Slots come from a [`FencedRingBuffer`] tagged with the graphics recording
//! fence. When the ring cannot satisfy a request the heap is rolled over:
//!
//! ```text
//!   size < max ──► retire current heap, create one twice the size
//!   size = max ──► park current heap in the heap pool,
//!                  take back one the GPU is done with (waiting if needed)
//! ```
//!
//! Every roll-over invalidates previously reserved slots from the caller's
//! point of view; [`SlotReservation::rolled_over`] tells it to rebind.

use alloc::vec::Vec;
use core::fmt;
use core::mem;

use cinder_core::{
    CpuDescriptorHandle, DescriptorHeap, DescriptorHeapDesc, DescriptorHeapKind,
    DescriptorHeapSource, Error, FenceTimeline, FenceValue, GpuDescriptorHandle, GpuDevice,
    QueueFences, QueueType, Result,
};
use cinder_mem::{BoundedFencePool, FencedRingBuffer, RingConfig};

use crate::config::OnlineHeapConfig;
use crate::context::SharedContext;

/// Roll-overs tried before a reservation gives up
const MAX_ROLL_OVER_ATTEMPTS: usize = 32;

/// Result of a slot reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotReservation {
    /// First reserved slot
    pub first_slot: u32,
    /// The heap was replaced while reserving
    pub rolled_over: bool,
}

/// A shader-visible descriptor heap with ring-allocated slots
pub struct OnlineDescriptorHeap<D: GpuDevice> {
    heap: D::Heap,
    desc: DescriptorHeapDesc,
    cpu_base: CpuDescriptorHandle,
    gpu_base: GpuDescriptorHandle,
    increment: u32,
    max_size: u32,
    ring: FencedRingBuffer,
    heap_pool: BoundedFencePool<D::Heap>,
}

impl<D: GpuDevice> OnlineDescriptorHeap<D> {
    /// Create the initial heap
    pub fn new(
        shared: &SharedContext<D>,
        kind: DescriptorHeapKind,
        config: OnlineHeapConfig,
    ) -> Result<Self> {
        if !kind.can_be_shader_visible()
            || config.initial_size == 0
            || config.initial_size > config.max_size
        {
            return Err(Error::InvalidParameter);
        }

        let desc = DescriptorHeapDesc::shader_visible(kind, config.initial_size);
        let heap = create_heap(shared, &desc)?;
        let (cpu_base, gpu_base) = heap_bases(&heap)?;
        let ring = FencedRingBuffer::new(
            RingConfig::new(config.initial_size).with_ledger_capacity(config.ledger_capacity),
        )?;

        Ok(Self {
            heap,
            desc,
            cpu_base,
            gpu_base,
            increment: shared.device().descriptor_increment(kind),
            max_size: config.max_size,
            ring,
            heap_pool: BoundedFencePool::new(config.pool_depth),
        })
    }

    /// Reserve `num_slots` contiguous slots for the batch being recorded
    pub fn reserve_slots(
        &mut self,
        shared: &SharedContext<D>,
        num_slots: u32,
    ) -> Result<SlotReservation> {
        if num_slots > self.max_size {
            return Err(Error::InvalidParameter);
        }

        let mut rolled_over = false;
        let mut reclaimed = false;
        for _ in 0..MAX_ROLL_OVER_ATTEMPTS {
            let fence = shared.recording_fence(QueueType::Graphics);
            match self.ring.allocate(num_slots, fence) {
                Ok(first_slot) => {
                    return Ok(SlotReservation {
                        first_slot,
                        rolled_over,
                    })
                }
                Err(Error::RingExhausted | Error::LedgerExhausted) if !reclaimed => {
                    reclaimed = true;
                    self.ring.deallocate(shared.completed_fence(QueueType::Graphics));
                }
                Err(Error::RingExhausted | Error::LedgerExhausted | Error::InvalidParameter) => {
                    self.roll_over(shared)?;
                    rolled_over = true;
                }
                Err(err) => return Err(err),
            }
        }

        log::error!(
            "OnlineDescriptorHeap: no room for {} {:?} slots after {} roll-overs",
            num_slots,
            self.desc.kind,
            MAX_ROLL_OVER_ATTEMPTS
        );
        Err(Error::RingExhausted)
    }

    /// Replace the current heap
    fn roll_over(&mut self, shared: &SharedContext<D>) -> Result<()> {
        let recording = shared.recording_fence(QueueType::Graphics);
        let size = self.desc.num_descriptors;

        if size < self.max_size {
            let desc = DescriptorHeapDesc::shader_visible(
                self.desc.kind,
                size.saturating_mul(2).min(self.max_size),
            );
            let heap = create_heap(shared, &desc)?;
            let (cpu_base, gpu_base) = heap_bases(&heap)?;

            let old = mem::replace(&mut self.heap, heap);
            shared.retire_object(
                old,
                QueueFences::single(QueueType::Graphics, recording),
                true,
                Vec::new(),
            );
            self.desc = desc;
            self.cpu_base = cpu_base;
            self.gpu_base = gpu_base;

            log::debug!(
                "OnlineDescriptorHeap: grew {:?} heap {} -> {} slots",
                desc.kind,
                size,
                desc.num_descriptors
            );
        } else {
            let completed = shared.completed_fence(QueueType::Graphics);
            let desc = self.desc;
            let stalled = self
                .heap_pool
                .oldest_fence()
                .is_some_and(|fence| fence >= recording);
            let heap = if stalled {
                // every parked heap is still used by the batch being recorded
                log::debug!(
                    "OnlineDescriptorHeap: {:?} pool holds only batch {}, creating a heap",
                    desc.kind,
                    recording
                );
                create_heap(shared, &desc)?
            } else {
                self.heap_pool.retrieve_from_pool(
                    completed,
                    |fence| shared.wait_for_fence(QueueType::Graphics, fence),
                    || create_heap(shared, &desc),
                )?
            };
            let (cpu_base, gpu_base) = heap_bases(&heap)?;

            let old = mem::replace(&mut self.heap, heap);
            self.heap_pool.return_to_pool(old, recording);
            self.cpu_base = cpu_base;
            self.gpu_base = gpu_base;

            log::debug!(
                "OnlineDescriptorHeap: rolled {:?} heap over at fence {} ({} parked)",
                desc.kind,
                recording,
                self.heap_pool.len()
            );
        }

        self.ring.reset(self.desc.num_descriptors);
        Ok(())
    }

    /// Reclaim ring space up to `completed_fence`
    pub fn deallocate(&mut self, completed_fence: FenceValue) {
        self.ring.deallocate(completed_fence);
    }

    /// Drop one parked heap idle for `threshold` fences
    pub fn trim(&mut self, threshold: u64, completed_fence: FenceValue) -> bool {
        self.heap_pool.trim(threshold, completed_fence)
    }

    /// CPU handle of `slot`
    #[inline]
    pub fn cpu_handle(&self, slot: u32) -> CpuDescriptorHandle {
        debug_assert!(slot < self.desc.num_descriptors);
        self.cpu_base.offset(slot, self.increment)
    }

    /// GPU handle of `slot`
    #[inline]
    pub fn gpu_handle(&self, slot: u32) -> GpuDescriptorHandle {
        debug_assert!(slot < self.desc.num_descriptors);
        self.gpu_base.offset(slot, self.increment)
    }

    /// Current heap
    pub fn heap(&self) -> &D::Heap {
        &self.heap
    }

    /// Slots in the current heap
    pub fn size(&self) -> u32 {
        self.desc.num_descriptors
    }

    /// Largest size the heap grows to
    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Heap type
    pub fn kind(&self) -> DescriptorHeapKind {
        self.desc.kind
    }

    /// Heaps parked in the pool
    pub fn parked_heaps(&self) -> usize {
        self.heap_pool.len()
    }

    /// Slot ring of the current heap
    pub fn ring(&self) -> &FencedRingBuffer {
        &self.ring
    }
}

fn create_heap<D: GpuDevice>(
    shared: &SharedContext<D>,
    desc: &DescriptorHeapDesc,
) -> Result<D::Heap> {
    shared.try_allocate_with_fallback(|| shared.device().create_descriptor_heap(desc))
}

fn heap_bases<H: DescriptorHeap>(heap: &H) -> Result<(CpuDescriptorHandle, GpuDescriptorHandle)> {
    let gpu_base = heap.gpu_start().ok_or(Error::InvalidParameter)?;
    Ok((heap.cpu_start(), gpu_base))
}

impl<D: GpuDevice> fmt::Debug for OnlineDescriptorHeap<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnlineDescriptorHeap")
            .field("desc", &self.desc)
            .field("cpu_base", &self.cpu_base)
            .field("gpu_base", &self.gpu_base)
            .field("max_size", &self.max_size)
            .field("ring", &self.ring)
            .field("parked_heaps", &self.heap_pool.len())
            .finish()
    }
}
