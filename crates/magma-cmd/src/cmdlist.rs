//! # Administrative Command Lists
//!
//! Fixed command sequences every push buffer submits around client work:
//! a syncpoint increment after each batch, and a cache flush followed by a
//! one-word barrier ahead of the next one.
//!
//! Both lists are written once into a small GART buffer at construction:
//!
//! ```text
//! word 0          3                      11  12
//! ┌───────────────┬──────────────────────┬───┐
//! │ fence (3)     │ cache flush (8)      │NOP│
//! └───────────────┴──────────────────────┴───┘
//! ```

use magma_core::{ByteSize, GpuAddr, Result};
use magma_mem::BufferObject;

use crate::gpfifo::{EntryFlags, GpFifoEntry};

// =============================================================================
// METHOD HEADERS
// =============================================================================

/// Immediate-data method header: `data` travels inside the header word
pub const fn method_immd(mthd: u32, subc: u32, data: u32) -> u32 {
    mthd | (subc << 13) | (data << 16) | (4 << 29)
}

/// Incrementing method header followed by `count` data words
pub const fn method_incr(mthd: u32, subc: u32, count: u32) -> u32 {
    mthd | (subc << 13) | (count << 16) | (1 << 29)
}

/// Size of the builtin command buffer
pub const BUILTIN_CMDBUF_SIZE: ByteSize = ByteSize::KIB_4;

/// Alignment of the builtin command buffer and the zcull context
pub const BUILTIN_ALIGN: u64 = 0x2_0000;

/// Words in the fence command list
pub const FENCE_CMDLIST_WORDS: u32 = 3;

/// Words in the cache flush command list, not counting the barrier
pub const FLUSH_CMDLIST_WORDS: u32 = 8;

const SYNCPT_INCR: u32 = 1 << 20;
const SYNCPT_CACHE_FLUSH: u32 = 1 << 16;

// =============================================================================
// GENERATORS
// =============================================================================

/// Syncpoint increment for `syncpt_id`
pub const fn fence_cmdlist(syncpt_id: u32) -> [u32; FENCE_CMDLIST_WORDS as usize] {
    [
        method_immd(0x451, 0, 0),
        method_incr(0x0b2, 0, 1),
        syncpt_id | SYNCPT_INCR | SYNCPT_CACHE_FLUSH,
    ]
}

/// Cache flush sequence plus the trailing NOP used as barrier
pub const fn flush_cmdlist() -> [u32; FLUSH_CMDLIST_WORDS as usize + 1] {
    [
        method_incr(0x00b, 6, 1),
        0x8000_0000,
        method_incr(0x00b, 6, 1),
        0x7000_0000,
        // texture data invalidate
        method_immd(0x4a2, 0, 0),
        method_immd(0x369, 0, 0x1011),
        // texture header and sampler pools
        method_immd(0x50a, 0, 0),
        method_immd(0x509, 0, 0),
        0,
    ]
}

// =============================================================================
// LAYOUT
// =============================================================================

/// Where the administrative lists live and how long they are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdlistLayout {
    /// GPU address of the builtin command buffer
    pub base: GpuAddr,
    /// Fence list length in words
    pub fence_num_cmds: u32,
    /// Cache flush list length in words
    pub flush_num_cmds: u32,
}

impl CmdlistLayout {
    /// Write both lists into `bo`, which must be mapped for writing
    pub fn write(bo: &BufferObject, syncpt_id: u32) -> Result<Self> {
        let fence = fence_cmdlist(syncpt_id);
        let flush = flush_cmdlist();

        bo.write(0, &fence)?;
        bo.write(FENCE_CMDLIST_WORDS, &flush)?;

        log::trace!(
            "builtin cmdlists at {}: fence {:08x?} flush {:08x?}",
            bo.addr(),
            fence,
            flush
        );

        Ok(Self {
            base: bo.addr(),
            fence_num_cmds: FENCE_CMDLIST_WORDS,
            flush_num_cmds: FLUSH_CMDLIST_WORDS,
        })
    }

    /// Entry running the fence list
    pub fn fence_entry(&self) -> GpFifoEntry {
        GpFifoEntry::new(
            self.base,
            self.fence_num_cmds,
            EntryFlags::NOT_MAIN | EntryFlags::NO_PREFETCH,
        )
    }

    /// Entry running the cache flush list
    pub fn flush_entry(&self) -> GpFifoEntry {
        GpFifoEntry::new(
            self.base.offset(4 * self.fence_num_cmds as u64),
            self.flush_num_cmds,
            EntryFlags::NOT_MAIN,
        )
    }

    /// Single-word barrier entry after the cache flush
    pub fn barrier_entry(&self) -> GpFifoEntry {
        GpFifoEntry::new(
            self.base
                .offset(4 * (self.fence_num_cmds + self.flush_num_cmds) as u64),
            1,
            EntryFlags::NOT_MAIN | EntryFlags::NO_PREFETCH,
        )
    }
}
