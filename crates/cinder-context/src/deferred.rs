//! # Deferred Deletion
//!
//! Retired objects and suballocation blocks wait here until every queue that
//! referenced them is done with them.
//!
//! Entries are appended in non-decreasing fence order per queue, so trimming
//! pops from the front and stops at the first entry that is not ready.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use cinder_core::{DeferredWait, FenceTimeline, QueueFences};
use cinder_mem::{SuballocationBlock, Suballocator};

/// Check if something last referenced at `last_fences` may be destroyed
///
/// For each queue with a nonzero fence: with `completion_required` the GPU
/// must have completed it, otherwise the batch must merely have been
/// submitted. Every deferred wait must also be satisfied.
pub fn ready_to_destroy<F: FenceTimeline + ?Sized>(
    timeline: &F,
    completion_required: bool,
    last_fences: &QueueFences,
    deferred_waits: &[DeferredWait],
) -> bool {
    let fences_done = last_fences.iter().all(|(queue, &fence)| {
        fence == 0
            || if completion_required {
                timeline.completed_fence(queue) >= fence
            } else {
                fence < timeline.recording_fence(queue)
            }
    });

    fences_done && DeferredWait::all_satisfied(deferred_waits)
}

// =============================================================================
// RETIRED ENTRIES
// =============================================================================

/// An object awaiting destruction; destroying it drops it
pub struct RetiredObject<T> {
    object: T,
    last_fences: QueueFences,
    completion_required: bool,
    deferred_waits: Vec<DeferredWait>,
}

impl<T> RetiredObject<T> {
    /// Retire `object`
    pub fn new(
        object: T,
        last_fences: QueueFences,
        completion_required: bool,
        deferred_waits: Vec<DeferredWait>,
    ) -> Self {
        Self {
            object,
            last_fences,
            completion_required,
            deferred_waits,
        }
    }

    /// Check if the object may be destroyed now
    pub fn ready_to_destroy<F: FenceTimeline + ?Sized>(&self, timeline: &F) -> bool {
        ready_to_destroy(
            timeline,
            self.completion_required,
            &self.last_fences,
            &self.deferred_waits,
        )
    }

    /// Fences the object was last referenced at
    pub fn last_fences(&self) -> &QueueFences {
        &self.last_fences
    }

    /// The retired object
    pub fn object(&self) -> &T {
        &self.object
    }
}

impl<T> fmt::Debug for RetiredObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetiredObject")
            .field("last_fences", &self.last_fences)
            .field("completion_required", &self.completion_required)
            .field("deferred_waits", &self.deferred_waits.len())
            .finish()
    }
}

/// A suballocation block awaiting return to its allocator
///
/// Always requires GPU completion.
pub struct RetiredSuballocation {
    block: SuballocationBlock,
    parent: Arc<dyn Suballocator>,
    last_fences: QueueFences,
}

impl RetiredSuballocation {
    /// Retire `block`, to be handed back to `parent`
    pub fn new(
        block: SuballocationBlock,
        parent: Arc<dyn Suballocator>,
        last_fences: QueueFences,
    ) -> Self {
        Self {
            block,
            parent,
            last_fences,
        }
    }

    /// Check if the block may be returned now
    pub fn ready_to_destroy<F: FenceTimeline + ?Sized>(&self, timeline: &F) -> bool {
        ready_to_destroy(timeline, true, &self.last_fences, &[])
    }

    /// Return the block to its allocator
    pub fn destroy(self) {
        self.parent.deallocate(self.block);
    }

    /// The retired block
    pub fn block(&self) -> SuballocationBlock {
        self.block
    }
}

impl fmt::Debug for RetiredSuballocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetiredSuballocation")
            .field("block", &self.block)
            .field("last_fences", &self.last_fences)
            .finish()
    }
}

// =============================================================================
// DEFERRED DELETION QUEUE
// =============================================================================

/// Two FIFO queues of retired objects and retired suballocations
///
/// Not synchronized; the owner holds a lock around every call. Dropping the
/// queue destroys everything still in it.
pub struct DeferredDeletionQueue<T> {
    objects: VecDeque<RetiredObject<T>>,
    suballocations: VecDeque<RetiredSuballocation>,
    destroyed_objects: u64,
    destroyed_suballocations: u64,
}

impl<T> DeferredDeletionQueue<T> {
    /// Create an empty queue
    pub const fn new() -> Self {
        Self {
            objects: VecDeque::new(),
            suballocations: VecDeque::new(),
            destroyed_objects: 0,
            destroyed_suballocations: 0,
        }
    }

    /// Queue `object`, or destroy it at once if it is already safe to
    ///
    /// When no queue memory can be reserved the object is leaked rather
    /// than destroyed early.
    pub fn add_object<F: FenceTimeline + ?Sized>(
        &mut self,
        timeline: &F,
        retired: RetiredObject<T>,
    ) {
        if retired.ready_to_destroy(timeline) {
            drop(retired);
            self.destroyed_objects += 1;
            return;
        }

        if self.objects.try_reserve(1).is_err() {
            log::warn!("DeferredDeletionQueue: out of memory, leaking retired object");
            core::mem::forget(retired);
            return;
        }
        self.objects.push_back(retired);
    }

    /// Queue `retired`, or return it to its allocator at once if it is
    /// already safe to
    pub fn add_suballocation<F: FenceTimeline + ?Sized>(
        &mut self,
        timeline: &F,
        retired: RetiredSuballocation,
    ) {
        if retired.ready_to_destroy(timeline) {
            retired.destroy();
            self.destroyed_suballocations += 1;
            return;
        }

        if self.suballocations.try_reserve(1).is_err() {
            log::warn!(
                "DeferredDeletionQueue: out of memory, leaking block {:?}",
                retired.block()
            );
            return;
        }
        self.suballocations.push_back(retired);
    }

    /// Destroy every entry at the front of either queue that is ready
    ///
    /// With `device_being_destroyed` everything is destroyed. Returns
    /// whether anything was destroyed.
    pub fn trim<F: FenceTimeline + ?Sized>(
        &mut self,
        timeline: &F,
        device_being_destroyed: bool,
    ) -> bool {
        let mut destroyed_objects = 0;
        while let Some(front) = self.objects.front() {
            if !device_being_destroyed && !front.ready_to_destroy(timeline) {
                break;
            }
            self.objects.pop_front();
            destroyed_objects += 1;
        }

        let mut destroyed_suballocations = 0;
        while let Some(front) = self.suballocations.front() {
            if !device_being_destroyed && !front.ready_to_destroy(timeline) {
                break;
            }
            if let Some(retired) = self.suballocations.pop_front() {
                retired.destroy();
                destroyed_suballocations += 1;
            }
        }

        if destroyed_objects + destroyed_suballocations > 0 {
            log::trace!(
                "DeferredDeletionQueue: destroyed {} objects, {} suballocations",
                destroyed_objects,
                destroyed_suballocations
            );
        }

        self.destroyed_objects += destroyed_objects;
        self.destroyed_suballocations += destroyed_suballocations;
        destroyed_objects + destroyed_suballocations > 0
    }

    /// Fences of the oldest retained object, if any
    pub fn fence_values_for_object_deletion(&self) -> Option<QueueFences> {
        self.objects.front().map(|retired| retired.last_fences)
    }

    /// Fences of the oldest retained suballocation, if any
    pub fn fence_values_for_suballocation_deletion(&self) -> Option<QueueFences> {
        self.suballocations.front().map(|retired| retired.last_fences)
    }

    /// Objects waiting
    pub fn pending_objects(&self) -> usize {
        self.objects.len()
    }

    /// Suballocations waiting
    pub fn pending_suballocations(&self) -> usize {
        self.suballocations.len()
    }

    /// Check if both queues are empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.suballocations.is_empty()
    }

    /// Objects destroyed so far
    pub fn destroyed_objects(&self) -> u64 {
        self.destroyed_objects
    }

    /// Suballocations returned so far
    pub fn destroyed_suballocations(&self) -> u64 {
        self.destroyed_suballocations
    }
}

impl<T> Default for DeferredDeletionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for DeferredDeletionQueue<T> {
    fn drop(&mut self) {
        self.objects.clear();
        for retired in self.suballocations.drain(..) {
            retired.destroy();
        }
    }
}

impl<T> fmt::Debug for DeferredDeletionQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredDeletionQueue")
            .field("pending_objects", &self.objects.len())
            .field("pending_suballocations", &self.suballocations.len())
            .field("destroyed_objects", &self.destroyed_objects)
            .field("destroyed_suballocations", &self.destroyed_suballocations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use cinder_core::{BufferHeap, FenceValue, QueueMap, QueueType, SharedFence};
    use cinder_mem::DirectAllocator;
    use crate::mock::MockDevice;

    struct Timeline {
        completed: QueueMap<FenceValue>,
        recording: QueueMap<FenceValue>,
    }

    impl Timeline {
        fn new(completed: FenceValue, recording: FenceValue) -> Self {
            Self {
                completed: QueueMap::from_fn(|_| completed),
                recording: QueueMap::from_fn(|_| recording),
            }
        }
    }

    impl FenceTimeline for Timeline {
        fn completed_fence(&self, queue: QueueType) -> FenceValue {
            self.completed[queue]
        }

        fn recording_fence(&self, queue: QueueType) -> FenceValue {
            self.recording[queue]
        }
    }

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn graphics(fence: FenceValue) -> QueueFences {
        QueueFences::single(QueueType::Graphics, fence)
    }

    fn direct() -> Arc<dyn Suballocator> {
        Arc::new(DirectAllocator::new(Arc::new(MockDevice::new()), BufferHeap::Upload))
    }

    #[test]
    fn test_destroyed_once_fence_completes() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut queue = DeferredDeletionQueue::new();
        let mut timeline = Timeline::new(9, 11);

        queue.add_object(
            &timeline,
            RetiredObject::new(Tracked(drops.clone()), graphics(10), true, vec![]),
        );
        assert!(!queue.trim(&timeline, false));
        assert_eq!(drops.load(Ordering::Relaxed), 0);

        timeline.completed[QueueType::Graphics] = 10;
        assert!(queue.trim(&timeline, false));
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert!(!queue.trim(&timeline, false));
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert_eq!(queue.destroyed_objects(), 1);
    }

    #[test]
    fn test_every_queue_must_complete() {
        let mut queue = DeferredDeletionQueue::new();
        let mut timeline = Timeline::new(0, 20);
        let mut fences = graphics(5);
        fences[QueueType::Copy] = 8;
        queue.add_object(&timeline, RetiredObject::new(1u32, fences, true, vec![]));

        timeline.completed[QueueType::Graphics] = 5;
        assert!(!queue.trim(&timeline, false));
        timeline.completed[QueueType::Copy] = 8;
        assert!(queue.trim(&timeline, false));
    }

    #[test]
    fn test_unsubmitted_use_destroyed_immediately() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut queue = DeferredDeletionQueue::new();
        let timeline = Timeline::new(0, 1);

        queue.add_object(
            &timeline,
            RetiredObject::new(Tracked(drops.clone()), QueueFences::default(), true, vec![]),
        );
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_submission_suffices_without_completion() {
        let mut queue = DeferredDeletionQueue::new();
        let mut timeline = Timeline::new(0, 4);
        queue.add_object(&timeline, RetiredObject::new(1u32, graphics(4), false, vec![]));
        assert_eq!(queue.pending_objects(), 1);

        timeline.recording[QueueType::Graphics] = 5;
        assert!(queue.trim(&timeline, false));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_deferred_waits_hold_destruction() {
        let fence = Arc::new(SharedFence::new(0));
        let mut queue = DeferredDeletionQueue::new();
        let timeline = Timeline::new(10, 11);
        let waits = vec![DeferredWait::new(fence.clone(), 3)];
        queue.add_object(&timeline, RetiredObject::new(1u32, graphics(10), true, waits));

        assert!(!queue.trim(&timeline, false));
        fence.signal(3);
        assert!(queue.trim(&timeline, false));
    }

    #[test]
    fn test_trim_stops_at_first_unready() {
        let mut queue = DeferredDeletionQueue::new();
        let mut timeline = Timeline::new(0, 10);
        for fence in [1, 2, 3] {
            queue.add_object(&timeline, RetiredObject::new(fence, graphics(fence), true, vec![]));
        }

        timeline.completed[QueueType::Graphics] = 2;
        queue.trim(&timeline, false);
        assert_eq!(queue.pending_objects(), 1);
        assert_eq!(queue.fence_values_for_object_deletion(), Some(graphics(3)));
    }

    #[test]
    fn test_teardown_destroys_everything() {
        let drops = Arc::new(AtomicUsize::new(0));
        let parent = direct();
        let mut queue = DeferredDeletionQueue::new();
        let timeline = Timeline::new(0, 10);

        let object = RetiredObject::new(Tracked(drops.clone()), graphics(7), true, vec![]);
        queue.add_object(&timeline, object);
        let block = parent.allocate(128).unwrap();
        let retired = RetiredSuballocation::new(block, parent.clone(), graphics(7));
        queue.add_suballocation(&timeline, retired);
        assert_eq!(parent.allocation_count(), 1);

        assert!(queue.trim(&timeline, true));
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert_eq!(parent.allocation_count(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_suballocations_need_completion() {
        let parent = direct();
        let mut queue = DeferredDeletionQueue::<()>::new();
        let mut timeline = Timeline::new(0, 10);

        let block = parent.allocate(64).unwrap();
        let retired = RetiredSuballocation::new(block, parent.clone(), graphics(3));
        queue.add_suballocation(&timeline, retired);
        assert_eq!(queue.fence_values_for_suballocation_deletion(), Some(graphics(3)));
        assert!(!queue.trim(&timeline, false));

        timeline.completed[QueueType::Graphics] = 3;
        assert!(queue.trim(&timeline, false));
        assert_eq!(parent.allocation_count(), 0);
        assert_eq!(queue.destroyed_suballocations(), 1);
    }

    #[test]
    fn test_drop_returns_blocks() {
        let parent = direct();
        let timeline = Timeline::new(0, 10);
        {
            let mut queue = DeferredDeletionQueue::<()>::new();
            let block = parent.allocate(64).unwrap();
            let retired = RetiredSuballocation::new(block, parent.clone(), graphics(5));
            queue.add_suballocation(&timeline, retired);
        }
        assert_eq!(parent.allocation_count(), 0);
    }
}
