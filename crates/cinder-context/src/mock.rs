//! In-memory device for tests.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use cinder_core::{
    BufferHeap, CpuDescriptorHandle, DescriptorHeap, DescriptorHeapDesc, DescriptorHeapKind,
    DescriptorHeapSource, Error, FenceValue, GpuDescriptorHandle, GpuDevice, MemorySource,
    QueueMap, QueueType, Result,
};

const HEAP_SPACING: u64 = 0x100_0000;
const GPU_ADDRESS_BIT: u64 = 1 << 40;

#[derive(Debug)]
pub struct MockHeap {
    cpu: CpuDescriptorHandle,
    gpu: Option<GpuDescriptorHandle>,
}

impl DescriptorHeap for MockHeap {
    fn cpu_start(&self) -> CpuDescriptorHandle {
        self.cpu
    }

    fn gpu_start(&self) -> Option<GpuDescriptorHandle> {
        self.gpu
    }
}

#[derive(Debug)]
pub struct MockBuffer {
    pub id: usize,
    pub size: u64,
    pub heap: BufferHeap,
}

/// Device memory that counts itself out of the live total on drop
#[derive(Debug)]
pub struct MockMemory {
    live: Arc<AtomicUsize>,
}

impl Drop for MockMemory {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct MockDevice {
    completed: QueueMap<AtomicU64>,
    heaps_created: AtomicUsize,
    buffers_created: AtomicUsize,
    failing_buffers: AtomicUsize,
    failing_memory: AtomicUsize,
    live_memory: Arc<AtomicUsize>,
    waits: AtomicUsize,
    lost: AtomicBool,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
        .is_ok()
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal `value` on `queue` as if the GPU finished it
    pub fn complete(&self, queue: QueueType, value: FenceValue) {
        self.completed[queue].fetch_max(value, Ordering::AcqRel);
    }

    /// Make the next `count` buffer creations run out of memory
    pub fn fail_next_buffers(&self, count: usize) {
        self.failing_buffers.store(count, Ordering::Relaxed);
    }

    /// Make the next `count` memory heap creations run out of memory
    pub fn fail_next_memory(&self, count: usize) {
        self.failing_memory.store(count, Ordering::Relaxed);
    }

    pub fn lose(&self) {
        self.lost.store(true, Ordering::Relaxed);
    }

    pub fn heaps_created(&self) -> usize {
        self.heaps_created.load(Ordering::Relaxed)
    }

    pub fn buffers_created(&self) -> usize {
        self.buffers_created.load(Ordering::Relaxed)
    }

    /// Memory heaps created and not yet dropped
    pub fn live_memory(&self) -> usize {
        self.live_memory.load(Ordering::Relaxed)
    }

    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::Relaxed)
    }
}

impl DescriptorHeapSource for MockDevice {
    type Heap = MockHeap;

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<MockHeap> {
        let index = self.heaps_created.fetch_add(1, Ordering::Relaxed) as u64 + 1;
        let base = index * HEAP_SPACING;
        Ok(MockHeap {
            cpu: CpuDescriptorHandle::new(base),
            gpu: desc
                .shader_visible
                .then(|| GpuDescriptorHandle::new(GPU_ADDRESS_BIT | base)),
        })
    }

    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32 {
        match kind {
            DescriptorHeapKind::Sampler => 16,
            _ => 32,
        }
    }
}

impl MemorySource for MockDevice {
    type Memory = MockMemory;

    fn create_memory_heap(&self, _heap: BufferHeap, _size: u64) -> Result<MockMemory> {
        if take_failure(&self.failing_memory) {
            return Err(Error::OutOfDeviceMemory);
        }

        self.live_memory.fetch_add(1, Ordering::Relaxed);
        Ok(MockMemory {
            live: self.live_memory.clone(),
        })
    }
}

impl GpuDevice for MockDevice {
    type Buffer = MockBuffer;

    fn create_buffer(&self, heap: BufferHeap, size: u64) -> Result<MockBuffer> {
        if take_failure(&self.failing_buffers) {
            return Err(Error::OutOfDeviceMemory);
        }

        let id = self.buffers_created.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(MockBuffer { id, size, heap })
    }

    fn query_completed_fence(&self, queue: QueueType) -> FenceValue {
        self.completed[queue].load(Ordering::Acquire)
    }

    fn wait_for_fence(&self, queue: QueueType, value: FenceValue) -> Result<()> {
        if self.lost.load(Ordering::Relaxed) {
            return Err(Error::DeviceLost);
        }
        self.waits.fetch_add(1, Ordering::Relaxed);
        self.complete(queue, value);
        Ok(())
    }
}
