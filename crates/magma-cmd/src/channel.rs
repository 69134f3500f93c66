//! # FIFO Channel
//!
//! The submission target a push buffer is bound to.

use core::fmt;

use magma_core::{Error, Result};

// =============================================================================
// CHANNEL CLASS
// =============================================================================

/// Object class of a GPFIFO channel
pub const FIFO_CHANNEL_CLASS: u32 = 0x8000_0001;

/// Channel identifier
pub type ChannelId = u32;

// =============================================================================
// FIFO CHANNEL
// =============================================================================

/// Description of a channel object a push buffer submits through
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FifoChannel {
    /// Object class
    class: u32,
    /// Channel ID
    chid: ChannelId,
}

impl FifoChannel {
    /// A GPFIFO channel
    pub const fn new(chid: ChannelId) -> Self {
        Self {
            class: FIFO_CHANNEL_CLASS,
            chid,
        }
    }

    /// A channel object of an arbitrary class
    pub const fn with_class(class: u32, chid: ChannelId) -> Self {
        Self { class, chid }
    }

    /// Get object class
    pub const fn class(&self) -> u32 {
        self.class
    }

    /// Get channel ID
    pub const fn chid(&self) -> ChannelId {
        self.chid
    }

    /// Check if this is a GPFIFO channel
    pub const fn is_fifo(&self) -> bool {
        self.class == FIFO_CHANNEL_CLASS
    }

    /// Fail with [`Error::InvalidChannelClass`] unless this is a GPFIFO channel
    pub fn check_fifo(&self) -> Result<()> {
        if self.is_fifo() {
            Ok(())
        } else {
            log::warn!("channel {} has class {:#x}, not a GPFIFO", self.chid, self.class);
            Err(Error::InvalidChannelClass)
        }
    }
}

impl fmt::Debug for FifoChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FifoChannel({} class {:#x})", self.chid, self.class)
    }
}
