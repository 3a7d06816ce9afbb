//! # Fence Pools
//!
//! Pools of objects that are recycled once the GPU reaches the fence value
//! they were returned with.
//!
//! Entries are appended on return and taken from the front on retrieval, so
//! the oldest return is always the first candidate for reuse. Since fence
//! values are handed out in increasing order, the front entry also carries
//! the smallest fence value in the pool.

use alloc::collections::VecDeque;
use core::fmt;

use cinder_core::{FenceValue, LockPolicy, Locked, Unlocked};

// =============================================================================
// FENCE QUEUE
// =============================================================================

/// A pooled resource and the fence value that makes it reusable
#[derive(Debug)]
pub struct PoolEntry<T> {
    /// Fence value the GPU has to reach before reuse
    pub fence_value: FenceValue,
    /// The pooled resource
    pub resource: T,
}

/// Unsynchronized fence-ordered queue backing the pools
#[derive(Debug)]
pub struct FenceQueue<T> {
    entries: VecDeque<PoolEntry<T>>,
}

impl<T> FenceQueue<T> {
    /// Create an empty queue
    pub const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append `resource`, reusable once `fence_value` is reached
    ///
    /// If the queue cannot grow the resource is dropped instead.
    pub fn push(&mut self, resource: T, fence_value: FenceValue) {
        if self.entries.try_reserve(1).is_err() {
            log::warn!(
                "FencePool: out of memory, dropping resource returned at fence {}",
                fence_value
            );
            return;
        }
        self.entries.push_back(PoolEntry {
            fence_value,
            resource,
        });
    }

    /// Pop the oldest entry if `current_fence` has reached it
    pub fn pop_ready(&mut self, current_fence: FenceValue) -> Option<T> {
        match self.entries.front() {
            Some(entry) if entry.fence_value <= current_fence => {
                self.entries.pop_front().map(|entry| entry.resource)
            }
            _ => None,
        }
    }

    /// Drop the oldest entry if it trails `current_fence` by `threshold` ticks
    ///
    /// At most one entry is evicted per call.
    pub fn trim(&mut self, threshold: u64, current_fence: FenceValue) -> bool {
        match self.entries.front() {
            Some(entry)
                if entry.fence_value <= current_fence
                    && current_fence - entry.fence_value >= threshold =>
            {
                self.entries.pop_front();
                true
            }
            _ => false,
        }
    }

    /// Fence value of the oldest entry
    pub fn oldest_fence(&self) -> Option<FenceValue> {
        self.entries.front().map(|entry| entry.fence_value)
    }

    /// Number of pooled entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for FenceQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// FENCE POOL
// =============================================================================

/// Fence-keyed object recycle pool
///
/// `L` selects whether each operation takes a lock ([`Locked`]) or the pool
/// is confined to one thread ([`Unlocked`]).
pub struct FencePool<T, L: LockPolicy = Unlocked> {
    queue: L::Cell<FenceQueue<T>>,
}

impl<T, L: LockPolicy> FencePool<T, L> {
    /// Create an empty pool
    pub fn new() -> Self {
        Self {
            queue: L::new_cell(FenceQueue::new()),
        }
    }

    /// Return `resource` to the pool, reusable once `fence_value` is reached
    pub fn return_to_pool(&self, resource: T, fence_value: FenceValue) {
        L::with(&self.queue, |queue| queue.push(resource, fence_value));
    }

    /// Take the oldest reusable resource, or create one
    ///
    /// `create` runs when the pool is empty or its oldest entry has a fence
    /// value beyond `current_fence`. Creation errors are returned as is.
    pub fn retrieve_from_pool<E>(
        &self,
        current_fence: FenceValue,
        create: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        match L::with(&self.queue, |queue| queue.pop_ready(current_fence)) {
            Some(resource) => Ok(resource),
            None => create(),
        }
    }

    /// Evict the oldest entry if it is at least `threshold` fences old
    pub fn trim(&self, threshold: u64, current_fence: FenceValue) -> bool {
        L::with(&self.queue, |queue| queue.trim(threshold, current_fence))
    }

    /// Fence value of the oldest entry
    pub fn oldest_fence(&self) -> Option<FenceValue> {
        L::with(&self.queue, |queue| queue.oldest_fence())
    }

    /// Number of pooled entries
    pub fn len(&self) -> usize {
        L::with(&self.queue, |queue| queue.len())
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T, L: LockPolicy> Default for FencePool<T, L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, L: LockPolicy> fmt::Debug for FencePool<T, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FencePool")
            .field("len", &self.len())
            .field("oldest_fence", &self.oldest_fence())
            .finish()
    }
}

// =============================================================================
// BOUNDED FENCE POOL
// =============================================================================

/// Fence pool that caps how many entries may be in flight
///
/// Once `max_in_flight` entries are pooled and none is reusable yet,
/// retrieval blocks on the oldest entry's fence instead of creating another
/// resource.
pub struct BoundedFencePool<T, L: LockPolicy = Unlocked> {
    pool: FencePool<T, L>,
    max_in_flight: usize,
}

enum Retrieval<T> {
    Reuse(T),
    Create,
    Wait(FenceValue),
}

impl<T, L: LockPolicy> BoundedFencePool<T, L> {
    /// Create a pool allowing `max_in_flight` pooled entries
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            pool: FencePool::new(),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Create a pool that never blocks
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Configured maximum depth
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Return `resource` to the pool, reusable once `fence_value` is reached
    pub fn return_to_pool(&self, resource: T, fence_value: FenceValue) {
        self.pool.return_to_pool(resource, fence_value);
    }

    /// Take a reusable resource, create one, or wait for the oldest
    ///
    /// `wait` receives the oldest entry's fence value and must block until the
    /// GPU reaches it. Its error (device loss) is returned without retrying.
    pub fn retrieve_from_pool<E>(
        &self,
        current_fence: FenceValue,
        wait: impl FnOnce(FenceValue) -> Result<(), E>,
        create: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let max_in_flight = self.max_in_flight;
        let decision = L::with(&self.pool.queue, |queue| match queue.oldest_fence() {
            None => Retrieval::Create,
            Some(fence) if fence <= current_fence => queue
                .pop_ready(current_fence)
                .map_or(Retrieval::Create, Retrieval::Reuse),
            Some(_) if queue.len() < max_in_flight => Retrieval::Create,
            Some(fence) => Retrieval::Wait(fence),
        });

        match decision {
            Retrieval::Reuse(resource) => Ok(resource),
            Retrieval::Create => create(),
            Retrieval::Wait(fence) => {
                log::debug!("BoundedFencePool: pool full, waiting for fence {}", fence);
                wait(fence)?;
                match L::with(&self.pool.queue, |queue| queue.pop_ready(fence)) {
                    Some(resource) => Ok(resource),
                    None => create(),
                }
            }
        }
    }

    /// Evict the oldest entry if it is at least `threshold` fences old
    pub fn trim(&self, threshold: u64, current_fence: FenceValue) -> bool {
        self.pool.trim(threshold, current_fence)
    }

    /// Fence value of the oldest entry
    pub fn oldest_fence(&self) -> Option<FenceValue> {
        self.pool.oldest_fence()
    }

    /// Number of pooled entries
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

impl<T, L: LockPolicy> fmt::Debug for BoundedFencePool<T, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedFencePool")
            .field("pool", &self.pool)
            .field("max_in_flight", &self.max_in_flight)
            .finish()
    }
}

static_assertions::assert_impl_all!(FencePool<u32, Locked>: Send, Sync);
static_assertions::assert_not_impl_any!(FencePool<u32, Unlocked>: Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use cinder_core::Error;

    fn fresh() -> Result<&'static str, Error> {
        Ok("new")
    }

    #[test]
    fn test_fifo_by_fence() {
        let pool: FencePool<&str> = FencePool::new();
        pool.return_to_pool("A", 5);
        pool.return_to_pool("B", 7);

        assert_eq!(pool.retrieve_from_pool(5, fresh), Ok("A"));
        assert_eq!(pool.retrieve_from_pool(6, fresh), Ok("new"));
        assert_eq!(pool.retrieve_from_pool(7, fresh), Ok("B"));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_empty_pool_creates() {
        let pool: FencePool<&str> = FencePool::new();
        assert_eq!(pool.retrieve_from_pool(100, fresh), Ok("new"));
    }

    #[test]
    fn test_creation_error_propagates() {
        let pool: FencePool<u32> = FencePool::new();
        pool.return_to_pool(1, 10);
        let result = pool.retrieve_from_pool(9, || Err(Error::OutOfDeviceMemory));
        assert_eq!(result, Err(Error::OutOfDeviceMemory));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_trim_one_per_call() {
        let pool: FencePool<u32> = FencePool::new();
        pool.return_to_pool(1, 1);
        pool.return_to_pool(2, 2);
        pool.return_to_pool(3, 50);

        assert!(!pool.trim(100, 50));
        assert!(pool.trim(10, 50));
        assert_eq!(pool.len(), 2);
        assert!(pool.trim(10, 50));
        assert_eq!(pool.oldest_fence(), Some(50));
        assert!(!pool.trim(10, 50));
        assert!(!pool.trim(0, 49));
    }

    #[test]
    fn test_bounded_creates_below_depth() {
        let pool: BoundedFencePool<&str> = BoundedFencePool::new(2);
        pool.return_to_pool("A", 10);

        let mut waited = false;
        let got = pool.retrieve_from_pool(
            1,
            |_| {
                waited = true;
                Ok::<(), Error>(())
            },
            fresh,
        );
        assert_eq!(got, Ok("new"));
        assert!(!waited);
    }

    #[test]
    fn test_bounded_waits_at_depth() {
        let pool: BoundedFencePool<&str> = BoundedFencePool::new(2);
        pool.return_to_pool("A", 10);
        pool.return_to_pool("B", 11);

        let mut waited_for = None;
        let got = pool.retrieve_from_pool(
            1,
            |fence| {
                waited_for = Some(fence);
                Ok::<(), Error>(())
            },
            fresh,
        );
        assert_eq!(got, Ok("A"));
        assert_eq!(waited_for, Some(10));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_bounded_wait_failure_propagates() {
        let pool: BoundedFencePool<&str> = BoundedFencePool::new(1);
        pool.return_to_pool("A", 10);

        let got = pool.retrieve_from_pool(1, |_| Err(Error::DeviceLost), fresh);
        assert_eq!(got, Err(Error::DeviceLost));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_bounded_reuses_reached_entry() {
        let pool: BoundedFencePool<&str> = BoundedFencePool::new(1);
        pool.return_to_pool("A", 3);
        let got = pool.retrieve_from_pool(3, |_| Err(Error::DeviceLost), fresh);
        assert_eq!(got, Ok("A"));
    }

    #[test]
    fn test_locked_pool_across_threads() {
        let pool: Arc<FencePool<u32, Locked>> = Arc::new(FencePool::new());
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        pool.return_to_pool(t * 100 + i, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.len(), 100);
        let mut taken = 0;
        while pool.retrieve_from_pool(1, || Err(())).is_ok() {
            taken += 1;
        }
        assert_eq!(taken, 100);
    }
}
