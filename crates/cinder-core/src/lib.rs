//! # Cinder Core
//!
//! Foundational types, traits and error handling shared by the Cinder
//! resource lifecycle crates.
//!
//! Everything in Cinder is keyed on *fence values*: per-queue counters that
//! the GPU signals once all work submitted up to that value has completed.
//! A resource tagged with fence value `V` on a queue may be reused or
//! destroyed once that queue's completed value reaches `V`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       cinder-core                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Types     │  │    Sync     │  │      Traits         │  │
//! │  │ (QueueType, │  │ (SharedFence│  │  (FenceTimeline,    │  │
//! │  │  handles)   │  │  LockPolicy)│  │   GpuDevice)        │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

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

pub mod error;
pub mod sync;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use error::{Error, Result};
pub use sync::{DeferredWait, LockPolicy, Locked, SharedFence, Unlocked};
pub use traits::*;
pub use types::*;
