//! # Synchronization Primitives
//!
//! CPU-visible fences, deferred wait conditions and the locking policy
//! used by the free-threaded pools.

use alloc::sync::Arc;
use core::cell::RefCell;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::types::FenceValue;

// =============================================================================
// SHARED FENCE
// =============================================================================

/// CPU-visible timeline fence
///
/// Holds the last value signaled by whoever drives it (an external queue,
/// an event, another device). Readers only ever observe it moving forward.
#[derive(Debug, Default)]
pub struct SharedFence {
    value: AtomicU64,
}

impl SharedFence {
    /// Create a fence at `initial_value`
    pub const fn new(initial_value: FenceValue) -> Self {
        Self {
            value: AtomicU64::new(initial_value),
        }
    }

    /// Last signaled value
    pub fn completed_value(&self) -> FenceValue {
        self.value.load(Ordering::Acquire)
    }

    /// Signal `value`; lower values than the current one are ignored
    pub fn signal(&self, value: FenceValue) {
        self.value.fetch_max(value, Ordering::AcqRel);
    }

    /// Check if `value` has been reached
    pub fn is_reached(&self, value: FenceValue) -> bool {
        self.completed_value() >= value
    }
}

// =============================================================================
// DEFERRED WAIT
// =============================================================================

/// Extra condition a retired object waits on before destruction
#[derive(Debug, Clone)]
pub struct DeferredWait {
    /// Fence to observe
    pub fence: Arc<SharedFence>,
    /// Value the fence has to reach
    pub value: FenceValue,
}

impl DeferredWait {
    /// Create a wait for `fence` to reach `value`
    pub fn new(fence: Arc<SharedFence>, value: FenceValue) -> Self {
        Self { fence, value }
    }

    /// Whether the condition holds
    pub fn is_satisfied(&self) -> bool {
        self.fence.is_reached(self.value)
    }

    /// Whether every wait in `waits` holds
    pub fn all_satisfied(waits: &[DeferredWait]) -> bool {
        waits.iter().all(DeferredWait::is_satisfied)
    }
}

// =============================================================================
// LOCKING POLICY
// =============================================================================

/// Locking policy for containers usable single- or multi-threaded
///
/// The policy is chosen by type parameter when the container is built.
/// [`Unlocked`] stores state in a `RefCell`, so the container is not `Sync`
/// and cannot be shared across threads at all; [`Locked`] wraps it in a spin
/// mutex held for the duration of each operation.
pub trait LockPolicy {
    /// Storage cell for guarded state
    type Cell<T>;

    /// Wrap `value` in a cell
    fn new_cell<T>(value: T) -> Self::Cell<T>;

    /// Run `f` with exclusive access to the cell contents
    fn with<T, R>(cell: &Self::Cell<T>, f: impl FnOnce(&mut T) -> R) -> R;

    /// Exclusive access through a unique borrow, never locks
    fn get_mut<T>(cell: &mut Self::Cell<T>) -> &mut T;
}

/// No synchronization; single-threaded callers only
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlocked;

impl LockPolicy for Unlocked {
    type Cell<T> = RefCell<T>;

    fn new_cell<T>(value: T) -> RefCell<T> {
        RefCell::new(value)
    }

    fn with<T, R>(cell: &RefCell<T>, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut cell.borrow_mut())
    }

    fn get_mut<T>(cell: &mut RefCell<T>) -> &mut T {
        cell.get_mut()
    }
}

/// Mutex held for each operation; free-threaded callers
#[derive(Debug, Clone, Copy, Default)]
pub struct Locked;

impl LockPolicy for Locked {
    type Cell<T> = spin::Mutex<T>;

    fn new_cell<T>(value: T) -> spin::Mutex<T> {
        spin::Mutex::new(value)
    }

    fn with<T, R>(cell: &spin::Mutex<T>, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut cell.lock())
    }

    fn get_mut<T>(cell: &mut spin::Mutex<T>) -> &mut T {
        cell.get_mut()
    }
}

static_assertions::assert_impl_all!(spin::Mutex<u64>: Send, Sync);
static_assertions::assert_not_impl_any!(RefCell<u64>: Sync);
