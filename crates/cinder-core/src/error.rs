//! # Cinder Error Handling
//!
//! Error types for the resource lifecycle subsystem.
//!
//! Errors fall into four categories:
//! - resource exhaustion (a creation callback could not get device memory)
//! - bookkeeping failures (host memory ran out while updating metadata)
//! - capacity failures (a ring cannot satisfy a contiguous request yet)
//! - device loss (a fence wait will never be signaled)

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Cinder Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Cinder unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Out of GPU memory while creating a resource
    OutOfDeviceMemory,
    /// Out of host memory while maintaining bookkeeping
    OutOfMemory,
    /// Allocation failed for another reason
    AllocationFailed,

    // =========================================================================
    // Capacity Errors
    // =========================================================================
    /// Ring buffer has no reclaimed space for the request
    RingExhausted,
    /// Every ring ledger entry is tracking an outstanding wave
    LedgerExhausted,

    // =========================================================================
    // Device Errors
    // =========================================================================
    /// GPU device was lost
    DeviceLost,
    /// Fence wait timed out
    FenceTimeout,
}

impl Error {
    /// Whether freeing GPU or host memory could let a retry succeed
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfDeviceMemory | Self::OutOfMemory)
    }

    /// Whether the device can no longer make progress
    pub const fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost | Self::FenceTimeout)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),

            // Memory
            Self::OutOfDeviceMemory => write!(f, "out of device memory"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::AllocationFailed => write!(f, "allocation failed"),

            // Capacity
            Self::RingExhausted => write!(f, "ring buffer exhausted"),
            Self::LedgerExhausted => write!(f, "ring ledger exhausted"),

            // Device
            Self::DeviceLost => write!(f, "device lost"),
            Self::FenceTimeout => write!(f, "fence wait timeout"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
