//! # Cinder Context
//!
//! Deferred deletion, online descriptor heaps and the context that ties the
//! lifecycle components to the per-queue fence timelines.
//!
//! ## Threading
//!
//! - [`SharedContext`] is `Sync`: buffer pools, CPU descriptor heaps,
//!   suballocators and the deferred deletion queue are all locked.
//! - [`ImmediateContext`] is `!Sync` and driven by the submission thread; it
//!   owns the online heaps, whose slot rings are never locked.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod config;
pub mod context;
pub mod deferred;
pub mod online_heap;

#[cfg(test)]
mod mock;

// Re-exports for convenience
pub use config::{ContextConfig, OnlineHeapConfig, DEFAULT_BUFFER_POOL_TRIM_THRESHOLD};
pub use context::{ImmediateContext, RetiredBox, SharedContext, Suballocation};
pub use deferred::{ready_to_destroy, DeferredDeletionQueue, RetiredObject, RetiredSuballocation};
pub use online_heap::{OnlineDescriptorHeap, SlotReservation};
