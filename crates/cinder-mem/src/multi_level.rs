//! # Multi-Level Pool
//!
//! Size-bucketed fence pools for variable-size transient buffers.
//!
//! A request of `size` bytes lands in bucket `ceil(size / MULTIPLE) - 1` and
//! is created at the bucket size `(index + 1) * MULTIPLE`, so any resource in
//! a bucket can serve any request mapping to it.

use alloc::vec::Vec;
use core::fmt;

use cinder_core::{FenceValue, LockPolicy, Locked, Unlocked};

use crate::fence_pool::FenceQueue;

/// Bucket granularity for dynamic upload/readback buffers
pub const DYNAMIC_BUFFER_MULTIPLE: u64 = 64 * 1024;

/// Pool of dynamic buffers in 64 KiB buckets
pub type DynamicBufferPool<T, L = Locked> = MultiLevelPool<T, DYNAMIC_BUFFER_MULTIPLE, L>;

// =============================================================================
// MULTI-LEVEL POOL
// =============================================================================

/// Fence pools bucketed by multiples of `MULTIPLE` bytes
pub struct MultiLevelPool<T, const MULTIPLE: u64, L: LockPolicy = Unlocked> {
    buckets: L::Cell<Vec<FenceQueue<T>>>,
    trim_threshold: u64,
}

impl<T, const MULTIPLE: u64, L: LockPolicy> MultiLevelPool<T, MULTIPLE, L> {
    /// Create an empty pool evicting entries `trim_threshold` fences old
    pub fn new(trim_threshold: u64) -> Self {
        Self {
            buckets: L::new_cell(Vec::new()),
            trim_threshold,
        }
    }

    /// Bucket index serving `size` bytes
    #[inline]
    pub const fn bucket_index(size: u64) -> usize {
        if size == 0 {
            0
        } else {
            ((size - 1) / MULTIPLE) as usize
        }
    }

    /// Size resources are created at for a `size` byte request
    #[inline]
    pub const fn aligned_size(size: u64) -> u64 {
        (Self::bucket_index(size) as u64 + 1) * MULTIPLE
    }

    /// Return a resource originally requested for `size` bytes
    pub fn return_to_pool(&self, size: u64, resource: T, fence_value: FenceValue) {
        let index = Self::bucket_index(size);
        L::with(&self.buckets, |buckets| {
            if index >= buckets.len() {
                let extra = index + 1 - buckets.len();
                if buckets.try_reserve(extra).is_err() {
                    log::warn!(
                        "MultiLevelPool: out of memory growing to {} buckets, dropping resource",
                        index + 1
                    );
                    return;
                }
                buckets.resize_with(index + 1, FenceQueue::new);
            }
            buckets[index].push(resource, fence_value);
        });
    }

    /// Take a reusable resource for `size` bytes, or create one
    ///
    /// `create` receives the bucket-aligned size. It never runs under the
    /// pool lock.
    pub fn retrieve_from_pool<E>(
        &self,
        size: u64,
        current_fence: FenceValue,
        create: impl FnOnce(u64) -> Result<T, E>,
    ) -> Result<T, E> {
        let index = Self::bucket_index(size);
        let reused = L::with(&self.buckets, |buckets| {
            buckets
                .get_mut(index)
                .and_then(|bucket| bucket.pop_ready(current_fence))
        });

        match reused {
            Some(resource) => Ok(resource),
            None => {
                let aligned = Self::aligned_size(size);
                log::trace!("MultiLevelPool: creating {} byte resource", aligned);
                create(aligned)
            }
        }
    }

    /// Trim every bucket, evicting at most one entry from each
    pub fn trim(&self, current_fence: FenceValue) -> usize {
        let threshold = self.trim_threshold;
        L::with(&self.buckets, |buckets| {
            buckets
                .iter_mut()
                .map(|bucket| bucket.trim(threshold, current_fence))
                .filter(|&evicted| evicted)
                .count()
        })
    }

    /// Number of buckets allocated so far
    pub fn bucket_count(&self) -> usize {
        L::with(&self.buckets, |buckets| buckets.len())
    }

    /// Total pooled entries across buckets
    pub fn len(&self) -> usize {
        L::with(&self.buckets, |buckets| buckets.iter().map(FenceQueue::len).sum())
    }

    /// Check if every bucket is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured trim threshold
    pub fn trim_threshold(&self) -> u64 {
        self.trim_threshold
    }
}

impl<T, const MULTIPLE: u64, L: LockPolicy> fmt::Debug for MultiLevelPool<T, MULTIPLE, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiLevelPool")
            .field("multiple", &MULTIPLE)
            .field("buckets", &self.bucket_count())
            .field("len", &self.len())
            .field("trim_threshold", &self.trim_threshold)
            .finish()
    }
}
