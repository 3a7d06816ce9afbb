//! # Fenced Ring Buffer
//!
//! Contiguous range allocator over a fixed ring of slots.
//!
//! ```text
//!   0                                              size
//!   ├──────────┬───────────────────────┬───────────┤
//!   │ reclaimed│   in flight (waves)   │   free    │
//!   └──────────┴───────────────────────┴───────────┘
//!              head - size             tail
//! ```
//!
//! `head` and `tail` are unbounded counters; a position in the ring is the
//! counter modulo `size`. Allocations made under the same fence value form a
//! wave recorded in a small ledger. Reclaiming a wave moves `head` forward
//! by the number of slots the wave consumed.
//!
//! The ring is never locked; it belongs to the submission thread.

use cinder_core::{Error, FenceValue, Result};

/// Largest supported ledger; occupancy is tracked in a `u32` mask
pub const MAX_LEDGER_CAPACITY: u32 = u32::BITS;

/// Default number of waves a ring can track
pub const DEFAULT_LEDGER_CAPACITY: u32 = 16;

static_assertions::const_assert!(DEFAULT_LEDGER_CAPACITY >= 1);
static_assertions::const_assert!(DEFAULT_LEDGER_CAPACITY <= MAX_LEDGER_CAPACITY);

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Ring buffer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingConfig {
    /// Number of slots
    pub size: u32,
    /// Number of waves that may be outstanding at once
    pub ledger_capacity: u32,
}

impl RingConfig {
    /// Ring of `size` slots with the default ledger
    pub const fn new(size: u32) -> Self {
        Self {
            size,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
        }
    }

    /// Override the ledger capacity
    pub const fn with_ledger_capacity(mut self, ledger_capacity: u32) -> Self {
        self.ledger_capacity = ledger_capacity;
        self
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self::new(0)
    }
}

// =============================================================================
// FENCED RING BUFFER
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Wave {
    fence_value: FenceValue,
    num_allocations: u64,
}

/// Ring allocator whose space is reclaimed as fences complete
#[derive(Debug)]
pub struct FencedRingBuffer {
    size: u32,
    head: u64,
    tail: u64,
    ledger: [Wave; MAX_LEDGER_CAPACITY as usize],
    ledger_capacity: u32,
    ledger_mask: u32,
    ledger_index: u32,
}

impl FencedRingBuffer {
    /// Create a ring from `config`
    ///
    /// Fails with [`Error::InvalidParameter`] if the ledger capacity is
    /// outside `1..=MAX_LEDGER_CAPACITY`.
    pub fn new(config: RingConfig) -> Result<Self> {
        if config.ledger_capacity == 0 || config.ledger_capacity > MAX_LEDGER_CAPACITY {
            return Err(Error::InvalidParameter);
        }

        Ok(Self {
            size: config.size,
            head: config.size as u64,
            tail: 0,
            ledger: [Wave::default(); MAX_LEDGER_CAPACITY as usize],
            ledger_capacity: config.ledger_capacity,
            ledger_mask: 0,
            ledger_index: 0,
        })
    }

    /// Ring of `size` slots with the default ledger
    pub fn with_size(size: u32) -> Self {
        Self {
            size,
            head: size as u64,
            tail: 0,
            ledger: [Wave::default(); MAX_LEDGER_CAPACITY as usize],
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            ledger_mask: 0,
            ledger_index: 0,
        }
    }

    /// Allocate `num_items` contiguous slots in the wave of `current_fence`
    ///
    /// Returns the offset of the first slot. A range that would cross the end
    /// of the ring is placed at offset 0 and the skipped slots are consumed
    /// into the current wave.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] if the ring is empty or `num_items`
    ///   exceeds its size
    /// - [`Error::LedgerExhausted`] if a new wave is needed but the next
    ///   ledger entry is still outstanding
    /// - [`Error::RingExhausted`] if not enough space has been reclaimed
    pub fn allocate(&mut self, num_items: u32, current_fence: FenceValue) -> Result<u32> {
        if self.size == 0 || num_items > self.size {
            return Err(Error::InvalidParameter);
        }
        if num_items == 0 {
            return Ok(self.tail_offset());
        }

        self.open_wave(current_fence)?;

        let num_items = num_items as u64;
        let tail_offset = self.tail_offset() as u64;
        if tail_offset + num_items > self.size as u64 {
            let remainder = self.size as u64 - tail_offset;
            if self.tail + remainder > self.head {
                return Err(Error::RingExhausted);
            }
            self.consume(remainder);
        }

        if self.tail + num_items > self.head {
            return Err(Error::RingExhausted);
        }

        let offset = self.tail_offset();
        self.consume(num_items);
        Ok(offset)
    }

    /// Reclaim every wave whose fence is at most `completed_fence`
    pub fn deallocate(&mut self, completed_fence: FenceValue) {
        for index in 0..self.ledger_capacity {
            if self.ledger_mask == 0 {
                break;
            }

            let bit = 1u32 << index;
            let wave = self.ledger[index as usize];
            if self.ledger_mask & bit != 0 && wave.fence_value <= completed_fence {
                self.head += wave.num_allocations;
                self.ledger[index as usize] = Wave::default();
                self.ledger_mask &= !bit;
                log::trace!(
                    "FencedRingBuffer: reclaimed {} slots of wave {}",
                    wave.num_allocations,
                    wave.fence_value
                );
            }
        }
    }

    /// Discard all state and resize to `size` slots
    pub fn reset(&mut self, size: u32) {
        self.size = size;
        self.head = size as u64;
        self.tail = 0;
        self.ledger = [Wave::default(); MAX_LEDGER_CAPACITY as usize];
        self.ledger_mask = 0;
        self.ledger_index = 0;
    }

    /// Make the current ledger entry the wave of `current_fence`
    fn open_wave(&mut self, current_fence: FenceValue) -> Result<()> {
        if !self.is_occupied(self.ledger_index) {
            self.occupy(self.ledger_index, current_fence);
            return Ok(());
        }
        if current_fence <= self.ledger[self.ledger_index as usize].fence_value {
            return Ok(());
        }

        let next = (self.ledger_index + 1) % self.ledger_capacity;
        if self.is_occupied(next) {
            log::debug!(
                "FencedRingBuffer: ledger full ({} waves outstanding)",
                self.outstanding_waves()
            );
            return Err(Error::LedgerExhausted);
        }

        self.ledger_index = next;
        self.occupy(next, current_fence);
        Ok(())
    }

    fn occupy(&mut self, index: u32, fence_value: FenceValue) {
        self.ledger[index as usize] = Wave {
            fence_value,
            num_allocations: 0,
        };
        self.ledger_mask |= 1 << index;
    }

    fn consume(&mut self, num_items: u64) {
        self.ledger[self.ledger_index as usize].num_allocations += num_items;
        self.tail += num_items;
    }

    #[inline]
    fn is_occupied(&self, index: u32) -> bool {
        self.ledger_mask & (1 << index) != 0
    }

    #[inline]
    fn tail_offset(&self) -> u32 {
        if self.size == 0 {
            0
        } else {
            (self.tail % self.size as u64) as u32
        }
    }

    /// Number of slots
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Waves not yet reclaimed
    pub fn outstanding_waves(&self) -> u32 {
        self.ledger_mask.count_ones()
    }

    /// Slots allocated (or skipped) and not yet reclaimed
    pub fn in_flight(&self) -> u64 {
        self.tail + self.size as u64 - self.head
    }

    /// Ledger capacity
    pub fn ledger_capacity(&self) -> u32 {
        self.ledger_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_waits_for_reclaim() {
        let mut ring = FencedRingBuffer::with_size(16);
        assert_eq!(ring.allocate(10, 1), Ok(0));
        assert_eq!(ring.allocate(10, 1), Err(Error::RingExhausted));
        // the skipped tail was consumed into wave 1
        assert_eq!(ring.in_flight(), 16);

        ring.deallocate(1);
        assert_eq!(ring.in_flight(), 0);
        assert_eq!(ring.allocate(10, 2), Ok(0));
    }

    #[test]
    fn test_allocations_never_cross_the_end() {
        let mut ring = FencedRingBuffer::with_size(64);
        let mut fence = 1;
        for _ in 0..50 {
            let offset = ring.allocate(7, fence).unwrap();
            assert!(offset + 7 <= 64);
            ring.deallocate(fence - 1);
            fence += 1;
        }
    }

    #[test]
    fn test_reclaim_follows_fences() {
        let mut ring = FencedRingBuffer::with_size(8);
        assert_eq!(ring.allocate(4, 1), Ok(0));
        assert_eq!(ring.allocate(4, 2), Ok(4));
        assert_eq!(ring.outstanding_waves(), 2);
        assert_eq!(ring.allocate(1, 3), Err(Error::RingExhausted));

        // the refused request still opened wave 3
        ring.deallocate(1);
        assert_eq!(ring.outstanding_waves(), 2);
        assert_eq!(ring.allocate(4, 3), Ok(0));
        assert_eq!(ring.allocate(1, 3), Err(Error::RingExhausted));
    }

    #[test]
    fn test_ledger_exhaustion() {
        let config = RingConfig::new(64).with_ledger_capacity(4);
        let mut ring = FencedRingBuffer::new(config).unwrap();
        for fence in 1..=4 {
            ring.allocate(1, fence).unwrap();
        }
        assert_eq!(ring.allocate(1, 5), Err(Error::LedgerExhausted));
        // the refused wave left the ledger untouched
        assert_eq!(ring.outstanding_waves(), 4);
        assert_eq!(ring.in_flight(), 4);

        ring.deallocate(1);
        assert_eq!(ring.allocate(1, 5), Ok(4));
        assert_eq!(ring.outstanding_waves(), 4);
    }

    #[test]
    fn test_same_fence_extends_wave() {
        let mut ring = FencedRingBuffer::with_size(32);
        ring.allocate(2, 3).unwrap();
        ring.allocate(2, 3).unwrap();
        ring.allocate(2, 2).unwrap();
        assert_eq!(ring.outstanding_waves(), 1);
        ring.deallocate(3);
        assert_eq!(ring.in_flight(), 0);
    }

    #[test]
    fn test_zero_items_and_bad_requests() {
        let mut ring = FencedRingBuffer::with_size(16);
        ring.allocate(5, 1).unwrap();
        assert_eq!(ring.allocate(0, 9), Ok(5));
        assert_eq!(ring.outstanding_waves(), 1);
        assert_eq!(ring.allocate(17, 1), Err(Error::InvalidParameter));

        let mut empty = FencedRingBuffer::with_size(0);
        assert_eq!(empty.allocate(1, 1), Err(Error::InvalidParameter));

        let bad = RingConfig::new(16).with_ledger_capacity(33);
        assert!(FencedRingBuffer::new(bad).is_err());
        assert!(FencedRingBuffer::new(RingConfig::new(16).with_ledger_capacity(0)).is_err());
    }

    #[test]
    fn test_reset() {
        let mut ring = FencedRingBuffer::with_size(8);
        ring.allocate(8, 1).unwrap();
        ring.reset(32);
        assert_eq!(ring.size(), 32);
        assert_eq!(ring.outstanding_waves(), 0);
        assert_eq!(ring.allocate(32, 2), Ok(0));
    }
}
