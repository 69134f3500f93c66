//! # GPFIFO
//!
//! Hardware queue entries and the queue interface the push buffer submits to.
//!
//! A GPFIFO entry points the GPU at a range of command words in memory:
//!
//! ```text
//!  entry1                                         entry0
//! ┌──┬────────────────────────┬──┬──────────┐   ┌────────────────────────┐
//! │NP│   word count (21 bit)  │NM│ addr hi  │   │      addr lo (32 bit)  │
//! └──┴────────────────────────┴──┴──────────┘   └────────────────────────┘
//!  31 30                    10  9  7       0
//! ```

use alloc::boxed::Box;
use core::fmt;

use bytemuck::{Pod, Zeroable};
use magma_core::{ByteSize, Fence, GpuAddr};

// =============================================================================
// ENTRY FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Flags stored in the high word of a GPFIFO entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u32 {
        /// Not a main command buffer (auxiliary/indirect block)
        const NOT_MAIN = 1 << 9;
        /// Do not prefetch past this entry
        const NO_PREFETCH = 1 << 31;
    }
}

/// Largest word count one entry can describe
pub const MAX_ENTRY_WORDS: u32 = (1 << 21) - 1;

const ADDR_HI_MASK: u32 = 0xff;
const COUNT_SHIFT: u32 = 10;

// =============================================================================
// ENTRY
// =============================================================================

/// One GPFIFO entry, in the layout the hardware reads
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GpFifoEntry {
    /// Low 32 bits of the command address
    pub entry0: u32,
    /// High address bits, word count and flags
    pub entry1: u32,
}

impl GpFifoEntry {
    /// Encode an entry for `num_cmds` words at `addr`
    pub fn new(addr: GpuAddr, num_cmds: u32, flags: EntryFlags) -> Self {
        debug_assert!(addr.is_aligned(4));
        debug_assert!(num_cmds <= MAX_ENTRY_WORDS);

        let raw = addr.raw();
        Self {
            entry0: raw as u32,
            entry1: ((raw >> 32) as u32 & ADDR_HI_MASK)
                | ((num_cmds & MAX_ENTRY_WORDS) << COUNT_SHIFT)
                | flags.bits(),
        }
    }

    /// Command address
    pub fn addr(&self) -> GpuAddr {
        GpuAddr::new(self.entry0 as u64 | (((self.entry1 & ADDR_HI_MASK) as u64) << 32))
    }

    /// Number of command words
    pub fn num_cmds(&self) -> u32 {
        (self.entry1 >> COUNT_SHIFT) & MAX_ENTRY_WORDS
    }

    /// Entry flags
    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.entry1)
    }

    /// The entry as one little-endian 64-bit word
    pub fn to_raw(self) -> u64 {
        u64::from_le_bytes(bytemuck::cast(self))
    }
}

impl fmt::Debug for GpFifoEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpFifoEntry({} x{} {:?})",
            self.addr(),
            self.num_cmds(),
            self.flags()
        )
    }
}

// =============================================================================
// QUEUE STATUS
// =============================================================================

/// Raw status returned by a failing queue operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus(pub u32);

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// =============================================================================
// QUEUE INTERFACE
// =============================================================================

/// A hardware command queue owned by one push buffer
///
/// Entries accumulate until [`GpuQueue::kickoff`] hands them to the GPU in
/// the order they were appended. Entries appended after a kickoff ride along
/// with the next one.
pub trait GpuQueue {
    /// Append an entry to the pending batch
    fn append_entry(&mut self, entry: GpFifoEntry);

    /// Expect one more syncpoint increment from the pending batch
    fn incr_fence(&mut self);

    /// Submit the pending batch
    fn kickoff(&mut self) -> core::result::Result<(), QueueStatus>;

    /// Fence that signals once the last kickoff has executed
    fn fence(&self) -> Fence;

    /// Syncpoint incremented by this queue
    fn syncpoint_id(&self) -> u32;

    /// Bind the zcull context buffer
    fn bind_zcull(&mut self, ctx: GpuAddr) -> core::result::Result<(), QueueStatus>;

    /// Number of entries waiting for the next kickoff
    fn pending_entries(&self) -> usize;

    /// Tear the queue down
    fn close(&mut self);
}

/// Creates hardware queues
pub trait QueueFactory {
    /// Create a queue in the client's address space
    fn create_queue(&self) -> core::result::Result<Box<dyn GpuQueue>, QueueStatus>;

    /// Size of the zcull context a queue needs
    fn zcull_ctx_size(&self) -> ByteSize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_packs_fields() {
        let e = GpFifoEntry::new(
            GpuAddr::new(0x12_3456_7890),
            0x1234,
            EntryFlags::NOT_MAIN | EntryFlags::NO_PREFETCH,
        );
        assert_eq!(e.entry0, 0x3456_7890);
        assert_eq!(e.entry1, 0x12 | (0x1234 << 10) | (1 << 9) | (1 << 31));
        assert_eq!(e.addr().raw(), 0x12_3456_7890);
        assert_eq!(e.num_cmds(), 0x1234);
        assert_eq!(e.flags(), EntryFlags::NOT_MAIN | EntryFlags::NO_PREFETCH);
    }

    #[test]
    fn test_entry_raw_word() {
        let e = GpFifoEntry::new(GpuAddr::new(0x1000), 3, EntryFlags::NOT_MAIN);
        assert_eq!(e.to_raw(), 0x1000 | (((3u64 << 10) | (1 << 9)) << 32));
    }

    #[test]
    fn test_plain_entry_has_no_flags() {
        let e = GpFifoEntry::new(GpuAddr::new(0x2000), 1, EntryFlags::empty());
        assert!(e.flags().is_empty());
        assert_eq!(e.num_cmds(), 1);
    }
}
