//! # Synchronization Primitives
//!
//! Syncpoint fences used to track GPU queue progress.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

// =============================================================================
// FENCE
// =============================================================================

/// A point in a GPU queue's completion order
///
/// A fence names a syncpoint and the value that syncpoint reaches once all
/// work queued before the fence has executed. Values increase monotonically
/// and are compared with wrap-around arithmetic.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fence {
    /// Syncpoint ID
    pub id: u32,
    /// Syncpoint value to reach
    pub value: u32,
}

impl Fence {
    /// Syncpoint ID of a fence that was never assigned
    pub const INVALID_ID: u32 = u32::MAX;

    /// Fence that does not track any work
    pub const NONE: Self = Self {
        id: Self::INVALID_ID,
        value: 0,
    };

    /// Create a new fence
    #[inline]
    pub const fn new(id: u32, value: u32) -> Self {
        Self { id, value }
    }

    /// Check if the fence refers to a syncpoint
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.id != Self::INVALID_ID
    }

    /// Check if this fence comes strictly after `other` on the same syncpoint
    #[inline]
    pub const fn is_after(&self, other: &Fence) -> bool {
        self.id == other.id && (self.value.wrapping_sub(other.value) as i32) > 0
    }

    /// Check if a syncpoint currently at `current` has passed this fence
    #[inline]
    pub const fn is_reached(&self, current: u32) -> bool {
        !self.is_valid() || (current.wrapping_sub(self.value) as i32) >= 0
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Fence {{{}, {}}}", self.id, self.value)
        } else {
            write!(f, "Fence {{none}}")
        }
    }
}

// =============================================================================
// SYNCPOINT
// =============================================================================

/// A host-visible syncpoint counter
///
/// `max` is the value the syncpoint reaches once all queued increments have
/// executed, `value` is the value it has reached so far.
#[derive(Debug)]
pub struct Syncpoint {
    /// Syncpoint ID
    id: u32,
    /// Current (completed) value
    value: AtomicU32,
    /// Highest value promised to waiters
    max: AtomicU32,
}

impl Syncpoint {
    /// Create a new syncpoint
    pub const fn new(id: u32, initial_value: u32) -> Self {
        Self {
            id,
            value: AtomicU32::new(initial_value),
            max: AtomicU32::new(initial_value),
        }
    }

    /// Get syncpoint ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Get current value
    pub fn value(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    /// Reserve one more increment and return the fence it will signal
    pub fn reserve(&self) -> Fence {
        let value = self.max.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        Fence::new(self.id, value)
    }

    /// Fence for the last reserved increment
    pub fn max_fence(&self) -> Fence {
        Fence::new(self.id, self.max.load(Ordering::Acquire))
    }

    /// Advance the current value up to the reserved maximum
    pub fn complete_all(&self) {
        let max = self.max.load(Ordering::Acquire);
        self.value.store(max, Ordering::Release);
    }

    /// Check if a fence on this syncpoint has been reached
    pub fn is_signaled(&self, fence: &Fence) -> bool {
        fence.id != self.id || fence.is_reached(self.value())
    }
}
