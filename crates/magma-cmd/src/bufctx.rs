//! # Buffer Contexts
//!
//! A buffer context groups the buffers a piece of state needs so a client can
//! declare them once and have every validation re-reference them.
//!
//! Declarations start out *pending*. Validation references every pending
//! buffer in the push buffer's current record and moves it to *current*; the
//! next flush moves current declarations back to pending so the following
//! record picks them up again.

use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;

use magma_core::{Error, Result};
use magma_mem::{BoFlags, BufferObject};

/// One declared buffer
#[derive(Debug, Clone)]
pub struct BufRef {
    /// Bin the declaration belongs to
    pub bin: u32,
    /// Declared buffer
    pub bo: BufferObject,
    /// Access and placement flags
    pub flags: BoFlags,
    /// Declaration needs a relocation slot
    pub reloc: bool,
}

#[derive(Debug)]
pub(crate) struct BufctxInner {
    bins: u32,
    pending: Vec<BufRef>,
    current: Vec<BufRef>,
    relocs: u32,
}

/// Reusable set of buffer declarations
///
/// Cloning yields another handle to the same context.
#[derive(Clone)]
pub struct BufferContext {
    inner: Rc<RefCell<BufctxInner>>,
}

impl BufferContext {
    /// Create a context with `bins` bins
    pub fn new(bins: u32) -> Result<Self> {
        if bins == 0 {
            return Err(Error::InvalidParameter);
        }

        Ok(Self {
            inner: Rc::new(RefCell::new(BufctxInner {
                bins,
                pending: Vec::new(),
                current: Vec::new(),
                relocs: 0,
            })),
        })
    }

    /// Number of bins
    pub fn bins(&self) -> u32 {
        self.inner.borrow().bins
    }

    /// Declare `bo` in `bin`
    pub fn refn(&self, bin: u32, bo: &BufferObject, flags: BoFlags) -> Result<()> {
        self.add(bin, bo, flags, false)
    }

    /// Declare `bo` in `bin` along with a relocation slot
    pub fn mthd(&self, bin: u32, bo: &BufferObject, flags: BoFlags) -> Result<()> {
        self.add(bin, bo, flags, true)
    }

    fn add(&self, bin: u32, bo: &BufferObject, flags: BoFlags, reloc: bool) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if bin >= inner.bins {
            return Err(Error::InvalidParameter);
        }

        inner.pending.push(BufRef {
            bin,
            bo: bo.clone(),
            flags,
            reloc,
        });
        if reloc {
            inner.relocs += 1;
        }
        Ok(())
    }

    /// Drop every declaration in `bin`
    pub fn reset(&self, bin: u32) {
        let mut inner = self.inner.borrow_mut();
        let mut dropped = 0;
        let mut keep = |r: &BufRef| {
            let hit = r.bin == bin;
            if hit && r.reloc {
                dropped += 1;
            }
            !hit
        };
        inner.pending.retain(&mut keep);
        inner.current.retain(&mut keep);
        inner.relocs -= dropped;
    }

    /// Relocation slots the declarations need
    pub fn relocs(&self) -> u32 {
        self.inner.borrow().relocs
    }

    /// Declarations waiting for validation
    pub fn pending_len(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Declarations attached to the current record
    pub fn current_len(&self) -> usize {
        self.inner.borrow().current.len()
    }

    /// Check if both handles name the same context
    pub fn ptr_eq(&self, other: &BufferContext) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Pending declarations in order
    pub(crate) fn pending(&self) -> Vec<(BufferObject, BoFlags)> {
        self.inner
            .borrow()
            .pending
            .iter()
            .map(|r| (r.bo.clone(), r.flags))
            .collect()
    }

    /// Move pending declarations in front of the current ones
    pub(crate) fn commit_pending(&self) {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.pending.append(&mut inner.current);
        core::mem::swap(&mut inner.pending, &mut inner.current);
    }

    /// Move current declarations in front of the pending ones
    pub(crate) fn fold_current(&self) {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.current.append(&mut inner.pending);
        core::mem::swap(&mut inner.pending, &mut inner.current);
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<BufctxInner>> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<RefCell<BufctxInner>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }
}

impl fmt::Debug for BufferContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("BufferContext")
            .field("bins", &inner.bins)
            .field("pending", &inner.pending.len())
            .field("current", &inner.current.len())
            .field("relocs", &inner.relocs)
            .finish()
    }
}
