//! # Context Orchestrator
//!
//! Owns every lifecycle component and drives them from the fence timelines.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ ImmediateContext (&mut self, submission thread)                  │
//! │   submit / flush / reserve_slots / wait_for_idle / trim          │
//! │   ┌───────────────────┐  ┌───────────────────┐                   │
//! │   │ view heap (online)│  │sampler heap(online)│                  │
//! │   └───────────────────┘  └───────────────────┘                   │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ SharedContext (&self, any thread)                                │
//! │   timelines · buffer pools · CPU descriptor heaps                │
//! │   suballocators · deferred deletion queue                        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Fence values start at 1 on every queue; 0 means "never used".

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use cinder_core::{
    BufferHeap, CpuDescriptorHandle, DeferredWait, DescriptorHeapKind, Error, FenceTimeline,
    FenceValue, GpuDevice, Locked, QueueFences, QueueMap, QueueMask, QueueType, Result,
};
use cinder_mem::{
    needs_own_allocation, select_suballocator, BuddyConfig, DescriptorHeapManager,
    DirectAllocator, DynamicBufferPool, HeapIndex, SuballocationBlock, Suballocator,
};

use crate::config::ContextConfig;
use crate::deferred::{DeferredDeletionQueue, RetiredObject, RetiredSuballocation};
use crate::online_heap::{OnlineDescriptorHeap, SlotReservation};

/// A retired object of any type
pub type RetiredBox = Box<dyn Send>;

// =============================================================================
// SUBALLOCATION
// =============================================================================

/// A block plus the allocator it has to go back to
pub struct Suballocation {
    block: SuballocationBlock,
    parent: Arc<dyn Suballocator>,
}

impl Suballocation {
    /// The allocated block
    pub fn block(&self) -> SuballocationBlock {
        self.block
    }
}

impl fmt::Debug for Suballocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suballocation").field("block", &self.block).finish()
    }
}

struct HeapAllocators {
    pooled: Arc<dyn Suballocator>,
    dedicated: Arc<dyn Suballocator>,
}

impl HeapAllocators {
    fn new<D: GpuDevice>(
        device: &Arc<D>,
        heap: BufferHeap,
        config: &ContextConfig,
    ) -> Result<Self> {
        // the largest block the buddy sees must fit in one backing heap
        let heap_size = config
            .buddy_threshold
            .checked_next_power_of_two()
            .ok_or(Error::InvalidParameter)?;
        let buddy = BuddyConfig::new(config.buddy_capacity, config.buddy_min_block_size, heap_size);

        Ok(Self {
            pooled: select_suballocator(
                Arc::clone(device),
                heap,
                config.use_buddy_suballocation,
                buddy,
            )?,
            dedicated: Arc::new(DirectAllocator::new(Arc::clone(device), heap)),
        })
    }
}

// =============================================================================
// SHARED CONTEXT
// =============================================================================

/// Free-threaded half of the context
pub struct SharedContext<D: GpuDevice> {
    device: Arc<D>,
    config: ContextConfig,
    recording: QueueMap<AtomicU64>,
    completed: QueueMap<AtomicU64>,
    upload_buffers: DynamicBufferPool<D::Buffer>,
    readback_buffers: DynamicBufferPool<D::Buffer>,
    descriptor_heaps: [DescriptorHeapManager<D, Locked>; DescriptorHeapKind::COUNT],
    upload_allocators: HeapAllocators,
    readback_allocators: HeapAllocators,
    deferred: spin::Mutex<DeferredDeletionQueue<RetiredBox>>,
}

impl<D: GpuDevice> SharedContext<D> {
    /// Create the shared state for `device`
    pub fn new(device: Arc<D>, config: ContextConfig) -> Result<Self> {
        let descriptor_heaps = DescriptorHeapKind::ALL.map(|kind| {
            DescriptorHeapManager::new(device.clone(), kind, config.cpu_descriptors_per_heap)
        });
        let upload_allocators = HeapAllocators::new(&device, BufferHeap::Upload, &config)?;
        let readback_allocators = HeapAllocators::new(&device, BufferHeap::Readback, &config)?;

        log::debug!(
            "SharedContext: created ({} CPU descriptors per heap, buddy suballocation {})",
            config.cpu_descriptors_per_heap,
            config.use_buddy_suballocation
        );

        Ok(Self {
            device,
            config,
            recording: QueueMap::from_fn(|_| AtomicU64::new(1)),
            completed: QueueMap::from_fn(|_| AtomicU64::new(0)),
            upload_buffers: DynamicBufferPool::new(config.buffer_pool_trim_threshold),
            readback_buffers: DynamicBufferPool::new(config.buffer_pool_trim_threshold),
            descriptor_heaps,
            upload_allocators,
            readback_allocators,
            deferred: spin::Mutex::new(DeferredDeletionQueue::new()),
        })
    }

    /// The device
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Configuration in use
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Timelines
    // -------------------------------------------------------------------------

    /// Close the batch being recorded on `queue` and return its fence value
    pub fn close_batch(&self, queue: QueueType) -> FenceValue {
        self.recording[queue].fetch_add(1, Ordering::AcqRel)
    }

    /// Block until `queue` reaches `value`
    ///
    /// Waiting on a batch that has not been submitted yet is refused with
    /// [`Error::InvalidParameter`].
    pub fn wait_for_fence(&self, queue: QueueType, value: FenceValue) -> Result<()> {
        if self.completed_fence(queue) >= value {
            return Ok(());
        }
        if value >= self.recording_fence(queue) {
            log::error!(
                "SharedContext: wait for unsubmitted fence {} on {:?}",
                value,
                queue
            );
            return Err(Error::InvalidParameter);
        }

        self.device.wait_for_fence(queue, value)?;
        self.completed[queue].fetch_max(value, Ordering::AcqRel);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Transient buffers
    // -------------------------------------------------------------------------

    fn buffer_pool(&self, heap: BufferHeap) -> &DynamicBufferPool<D::Buffer> {
        match heap {
            BufferHeap::Upload => &self.upload_buffers,
            BufferHeap::Readback => &self.readback_buffers,
        }
    }

    /// Get a buffer of at least `size` bytes on `heap`
    ///
    /// Buffers are tracked on the graphics timeline.
    pub fn acquire_buffer(&self, heap: BufferHeap, size: u64) -> Result<D::Buffer> {
        let completed = self.completed_fence(QueueType::Graphics);
        self.buffer_pool(heap).retrieve_from_pool(size, completed, |aligned| {
            self.try_allocate_with_fallback(|| self.device.create_buffer(heap, aligned))
        })
    }

    /// Hand a buffer acquired for `size` bytes back after the current batch
    pub fn release_buffer(&self, heap: BufferHeap, size: u64, buffer: D::Buffer) {
        let recording = self.recording_fence(QueueType::Graphics);
        self.buffer_pool(heap).return_to_pool(size, buffer, recording);
    }

    /// Pooled buffers on `heap`
    pub fn pooled_buffers(&self, heap: BufferHeap) -> usize {
        self.buffer_pool(heap).len()
    }

    // -------------------------------------------------------------------------
    // CPU descriptors
    // -------------------------------------------------------------------------

    /// Allocate a CPU descriptor slot of `kind`
    pub fn allocate_descriptor(
        &self,
        kind: DescriptorHeapKind,
    ) -> Result<(CpuDescriptorHandle, HeapIndex)> {
        let manager = &self.descriptor_heaps[kind.index()];
        self.try_allocate_with_fallback(|| manager.allocate_heap_slot())
    }

    /// Free a CPU descriptor slot of `kind`
    pub fn free_descriptor(
        &self,
        kind: DescriptorHeapKind,
        handle: CpuDescriptorHandle,
        index: HeapIndex,
    ) {
        self.descriptor_heaps[kind.index()].free_heap_slot(handle, index);
    }

    /// Descriptor heap manager for `kind`
    pub fn descriptor_heap_manager(
        &self,
        kind: DescriptorHeapKind,
    ) -> &DescriptorHeapManager<D, Locked> {
        &self.descriptor_heaps[kind.index()]
    }

    // -------------------------------------------------------------------------
    // Suballocation
    // -------------------------------------------------------------------------

    fn allocators(&self, heap: BufferHeap) -> &HeapAllocators {
        match heap {
            BufferHeap::Upload => &self.upload_allocators,
            BufferHeap::Readback => &self.readback_allocators,
        }
    }

    /// Allocate `size` bytes of `heap` memory
    ///
    /// Requests above the buddy threshold, or that cannot live at a nonzero
    /// offset, get a dedicated allocation.
    pub fn allocate_suballocation(
        &self,
        heap: BufferHeap,
        size: u64,
        cannot_be_offset: bool,
    ) -> Result<Suballocation> {
        let allocators = self.allocators(heap);
        let parent = if needs_own_allocation(size, self.config.buddy_threshold, cannot_be_offset) {
            &allocators.dedicated
        } else {
            &allocators.pooled
        };

        let block = self.try_allocate_with_fallback(|| parent.allocate(size))?;
        Ok(Suballocation {
            block,
            parent: Arc::clone(parent),
        })
    }

    /// Return `suballocation` once `last_fences` have completed
    pub fn retire_suballocation(&self, suballocation: Suballocation, last_fences: QueueFences) {
        let retired =
            RetiredSuballocation::new(suballocation.block, suballocation.parent, last_fences);
        self.deferred.lock().add_suballocation(self, retired);
    }

    // -------------------------------------------------------------------------
    // Deferred deletion
    // -------------------------------------------------------------------------

    /// Destroy `object` once it is no longer referenced by the GPU
    pub fn retire_object<T: Send + 'static>(
        &self,
        object: T,
        last_fences: QueueFences,
        completion_required: bool,
        deferred_waits: Vec<DeferredWait>,
    ) {
        let retired = RetiredObject::new(
            Box::new(object) as RetiredBox,
            last_fences,
            completion_required,
            deferred_waits,
        );
        self.deferred.lock().add_object(self, retired);
    }

    /// Destroy ready deferred entries; returns whether any were destroyed
    pub fn trim_deferred(&self) -> bool {
        self.deferred.lock().trim(self, false)
    }

    /// Trim deferred entries and idle pooled buffers
    pub fn trim(&self) -> bool {
        let freed = self.trim_deferred();
        let completed = self.completed_fence(QueueType::Graphics);
        self.upload_buffers.trim(completed);
        self.readback_buffers.trim(completed);
        freed
    }

    /// Destroy every deferred entry regardless of fences
    pub fn destroy_all_deferred(&self) {
        self.deferred.lock().trim(self, true);
    }

    /// Entries waiting in the deferred queue
    pub fn pending_deletions(&self) -> usize {
        let deferred = self.deferred.lock();
        deferred.pending_objects() + deferred.pending_suballocations()
    }

    // -------------------------------------------------------------------------
    // Allocation fallback
    // -------------------------------------------------------------------------

    /// Run `allocate`, reclaiming deferred memory and retrying while it
    /// fails with an out-of-memory error
    pub fn try_allocate_with_fallback<T>(
        &self,
        mut allocate: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        loop {
            match allocate() {
                Err(err) if err.is_out_of_memory() => {
                    if !self.allocation_fallback() {
                        return Err(err);
                    }
                    log::debug!("SharedContext: retrying allocation after reclaiming memory");
                }
                result => return result,
            }
        }
    }

    /// Free deferred memory; returns false when nothing could be freed
    fn allocation_fallback(&self) -> bool {
        if self.trim_deferred() {
            return true;
        }

        let oldest = {
            let deferred = self.deferred.lock();
            match (
                deferred.fence_values_for_object_deletion(),
                deferred.fence_values_for_suballocation_deletion(),
            ) {
                (Some(mut objects), Some(suballocations)) => {
                    objects.merge(&suballocations);
                    objects
                }
                (Some(fences), None) | (None, Some(fences)) => fences,
                (None, None) => return false,
            }
        };

        let mut waited = false;
        for (queue, &fence) in oldest.iter() {
            if fence == 0
                || fence >= self.recording_fence(queue)
                || self.completed_fence(queue) >= fence
            {
                continue;
            }
            if let Err(err) = self.wait_for_fence(queue, fence) {
                log::warn!("SharedContext: allocation fallback wait failed: {}", err);
                return false;
            }
            waited = true;
        }

        waited && self.trim_deferred()
    }
}

impl<D: GpuDevice> FenceTimeline for SharedContext<D> {
    fn completed_fence(&self, queue: QueueType) -> FenceValue {
        let observed = self.device.query_completed_fence(queue);
        let previous = self.completed[queue].fetch_max(observed, Ordering::AcqRel);
        previous.max(observed)
    }

    fn recording_fence(&self, queue: QueueType) -> FenceValue {
        self.recording[queue].load(Ordering::Acquire)
    }
}

impl<D: GpuDevice> fmt::Debug for SharedContext<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let recording = QueueMap::from_fn(|queue| self.recording[queue].load(Ordering::Relaxed));
        f.debug_struct("SharedContext")
            .field("recording", &recording)
            .field("config", &self.config)
            .field("deferred", &*self.deferred.lock())
            .finish()
    }
}

// =============================================================================
// IMMEDIATE CONTEXT
// =============================================================================

/// Submission-thread half of the context
pub struct ImmediateContext<D: GpuDevice> {
    shared: Arc<SharedContext<D>>,
    view_heap: OnlineDescriptorHeap<D>,
    sampler_heap: OnlineDescriptorHeap<D>,
}

impl<D: GpuDevice> ImmediateContext<D> {
    /// Create a context for `device`
    pub fn new(device: Arc<D>, config: ContextConfig) -> Result<Self> {
        Self::with_shared(Arc::new(SharedContext::new(device, config)?))
    }

    /// Create a context over existing shared state
    pub fn with_shared(shared: Arc<SharedContext<D>>) -> Result<Self> {
        let config = *shared.config();
        let view_heap =
            OnlineDescriptorHeap::new(&shared, DescriptorHeapKind::CbvSrvUav, config.view_heap)?;
        let sampler_heap =
            OnlineDescriptorHeap::new(&shared, DescriptorHeapKind::Sampler, config.sampler_heap)?;

        Ok(Self {
            shared,
            view_heap,
            sampler_heap,
        })
    }

    /// Shared state, cloneable to other threads
    pub fn shared(&self) -> &Arc<SharedContext<D>> {
        &self.shared
    }

    /// Submit the batch being recorded on `queue`
    ///
    /// Returns the fence value the batch signals, then trims.
    pub fn submit(&mut self, queue: QueueType) -> FenceValue {
        let fence = self.shared.close_batch(queue);
        log::trace!("ImmediateContext: submitted {:?} batch {}", queue, fence);
        self.trim();
        fence
    }

    /// Submit every queue in `queues`
    ///
    /// Returns the fence value of each submitted batch; other queues read 0.
    pub fn flush(&mut self, queues: QueueMask) -> QueueFences {
        let mut fences = QueueFences::default();
        for queue in QueueType::ALL {
            if queues.has(queue) {
                fences[queue] = self.shared.close_batch(queue);
            }
        }
        self.trim();
        fences
    }

    /// Reserve `num_slots` contiguous shader-visible slots of `kind`
    pub fn reserve_slots(
        &mut self,
        kind: DescriptorHeapKind,
        num_slots: u32,
    ) -> Result<SlotReservation> {
        let heap = match kind {
            DescriptorHeapKind::CbvSrvUav => &mut self.view_heap,
            DescriptorHeapKind::Sampler => &mut self.sampler_heap,
            _ => return Err(Error::InvalidParameter),
        };
        heap.reserve_slots(&self.shared, num_slots)
    }

    /// Online heap of `kind`
    pub fn online_heap(&self, kind: DescriptorHeapKind) -> Result<&OnlineDescriptorHeap<D>> {
        match kind {
            DescriptorHeapKind::CbvSrvUav => Ok(&self.view_heap),
            DescriptorHeapKind::Sampler => Ok(&self.sampler_heap),
            _ => Err(Error::InvalidParameter),
        }
    }

    /// Block until every submitted batch on `queue` has completed
    pub fn wait_for_idle(&mut self, queue: QueueType) -> Result<()> {
        let last_submitted = self.shared.recording_fence(queue) - 1;
        if last_submitted > 0 {
            self.shared.wait_for_fence(queue, last_submitted)?;
        }
        self.trim();
        Ok(())
    }

    /// Reclaim everything the GPU is done with
    pub fn trim(&mut self) -> bool {
        let freed = self.shared.trim();
        let completed = self.shared.completed_fence(QueueType::Graphics);
        let threshold = self.shared.config().buffer_pool_trim_threshold;
        for heap in [&mut self.view_heap, &mut self.sampler_heap] {
            heap.deallocate(completed);
            heap.trim(threshold, completed);
        }
        freed
    }
}

impl<D: GpuDevice> Drop for ImmediateContext<D> {
    fn drop(&mut self) {
        for queue in QueueType::ALL {
            if let Err(err) = self.wait_for_idle(queue) {
                log::warn!("ImmediateContext: {:?} did not go idle: {}", queue, err);
            }
        }
    }
}

impl<D: GpuDevice> fmt::Debug for ImmediateContext<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImmediateContext")
            .field("shared", &self.shared)
            .field("view_heap", &self.view_heap)
            .field("sampler_heap", &self.sampler_heap)
            .finish()
    }
}
