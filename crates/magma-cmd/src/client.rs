//! # Client
//!
//! Per-client state shared by every push buffer the client creates: the
//! buffer reference table, the registry of live push buffers, and the list of
//! buffer contexts attached to an open record.
//!
//! The reference table maps a buffer to the push buffer whose current record
//! references it. A push buffer about to reference a buffer owned by another
//! one flushes the owner first, so the GPU sees work in the order the client
//! issued it.

use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::fmt;

use hashbrown::HashMap;
use magma_core::{Error, PushbufHandle, Result};
use magma_mem::{BoAllocator, BufferId};

use crate::bufctx::{BufctxInner, BufferContext};
use crate::pushbuf::PushbufState;

/// Push buffer identifier
pub type PushbufId = PushbufHandle;

/// Owner of a live buffer reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KrefOwner {
    /// Push buffer whose current record holds the reference
    pub push: PushbufId,
    /// Index of the reference in that record
    pub index: u32,
}

struct OpenBufctx {
    push: PushbufId,
    ctx: Weak<RefCell<BufctxInner>>,
}

struct ClientInner {
    allocator: Rc<dyn BoAllocator>,
    krefs: RefCell<HashMap<BufferId, KrefOwner>>,
    pushbufs: RefCell<HashMap<PushbufId, Weak<RefCell<PushbufState>>>>,
    /// Most recently validated first
    open_bufctx: RefCell<Vec<OpenBufctx>>,
    next_pushbuf: Cell<u64>,
}

/// A client of the GPU: allocator plus shared reference table
///
/// Cloning yields another handle to the same client.
#[derive(Clone)]
pub struct Client {
    inner: Rc<ClientInner>,
}

impl Client {
    /// Create a client allocating through `allocator`
    pub fn new(allocator: Rc<dyn BoAllocator>) -> Self {
        Self {
            inner: Rc::new(ClientInner {
                allocator,
                krefs: RefCell::new(HashMap::new()),
                pushbufs: RefCell::new(HashMap::new()),
                open_bufctx: RefCell::new(Vec::new()),
                next_pushbuf: Cell::new(1),
            }),
        }
    }

    /// Buffer allocator
    pub fn allocator(&self) -> &dyn BoAllocator {
        &*self.inner.allocator
    }

    // =========================================================================
    // Reference table
    // =========================================================================

    /// Index of `push`'s reference to `bo`, if `push` owns one
    pub fn kref_get(&self, bo: BufferId, push: PushbufId) -> Option<u32> {
        self.inner
            .krefs
            .borrow()
            .get(&bo)
            .filter(|owner| owner.push == push)
            .map(|owner| owner.index)
    }

    /// Record or clear the owner of `bo`
    pub fn kref_set(&self, bo: BufferId, owner: Option<KrefOwner>) {
        let mut krefs = self.inner.krefs.borrow_mut();
        match owner {
            Some(owner) => {
                krefs.insert(bo, owner);
            }
            None => {
                krefs.remove(&bo);
            }
        }
    }

    /// Push buffer that owns a reference to `bo`
    pub fn push_get(&self, bo: BufferId) -> Option<PushbufId> {
        self.inner.krefs.borrow().get(&bo).map(|owner| owner.push)
    }

    /// Clear the entry for `bo` if `push` owns it
    pub(crate) fn kref_release(&self, bo: BufferId, push: PushbufId) {
        let mut krefs = self.inner.krefs.borrow_mut();
        if krefs.get(&bo).is_some_and(|owner| owner.push == push) {
            krefs.remove(&bo);
        }
    }

    /// Number of buffers currently owned by some push buffer
    pub fn tracked_buffers(&self) -> usize {
        self.inner.krefs.borrow().len()
    }

    /// Flush whichever other push buffer owns `bo`
    ///
    /// Fails with [`Error::Busy`] if the owner is in the middle of an
    /// operation; flush failures of the owner are logged and swallowed since
    /// the owner drops its references either way.
    pub(crate) fn flush_owner(&self, bo: BufferId, requester: PushbufId) -> Result<()> {
        let owner = match self.push_get(bo) {
            Some(owner) if owner != requester => owner,
            _ => return Ok(()),
        };

        let state = self
            .inner
            .pushbufs
            .borrow()
            .get(&owner)
            .and_then(Weak::upgrade);

        let Some(state) = state else {
            log::warn!("buffer {:?} owned by dead pushbuf {:?}", bo, owner);
            self.inner.krefs.borrow_mut().remove(&bo);
            return Ok(());
        };

        let mut other = state.try_borrow_mut().map_err(|_| Error::Busy)?;
        log::debug!("pushbuf {:?}: flushing {:?} to take buffer {:?}", requester, owner, bo);
        if let Err(e) = other.flush() {
            log::warn!("pushbuf {:?}: flush failed: {}", owner, e);
        }
        Ok(())
    }

    // =========================================================================
    // Push buffer registry
    // =========================================================================

    pub(crate) fn alloc_pushbuf_id(&self) -> PushbufId {
        let id = self.inner.next_pushbuf.get();
        self.inner.next_pushbuf.set(id + 1);
        PushbufId::new(id)
    }

    pub(crate) fn register(&self, id: PushbufId, state: Weak<RefCell<PushbufState>>) {
        self.inner.pushbufs.borrow_mut().insert(id, state);
    }

    pub(crate) fn unregister(&self, id: PushbufId) {
        self.inner.pushbufs.borrow_mut().remove(&id);
    }

    /// Number of live push buffers
    pub fn pushbuf_count(&self) -> usize {
        self.inner.pushbufs.borrow().len()
    }

    // =========================================================================
    // Open buffer contexts
    // =========================================================================

    /// Move `ctx` to the head of the open list, attached to `push`
    pub(crate) fn open_bufctx(&self, push: PushbufId, ctx: &BufferContext) {
        let mut open = self.inner.open_bufctx.borrow_mut();
        open.retain(|entry| {
            BufferContext::upgrade(&entry.ctx).is_some_and(|other| !other.ptr_eq(ctx))
        });
        open.insert(
            0,
            OpenBufctx {
                push,
                ctx: ctx.downgrade(),
            },
        );
    }

    /// Fold and unlink every context attached to `push`
    pub(crate) fn fold_bufctx(&self, push: PushbufId) {
        let folded: Vec<BufferContext> = {
            let mut open = self.inner.open_bufctx.borrow_mut();
            let mut folded = Vec::new();
            open.retain(|entry| {
                if entry.push != push {
                    return true;
                }
                if let Some(ctx) = BufferContext::upgrade(&entry.ctx) {
                    folded.push(ctx);
                }
                false
            });
            folded
        };

        for ctx in folded {
            ctx.fold_current();
        }
    }

    /// Number of contexts attached to an open record
    pub fn open_bufctx_count(&self) -> usize {
        self.inner.open_bufctx.borrow().len()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("krefs", &self.inner.krefs.borrow().len())
            .field("pushbufs", &self.inner.pushbufs.borrow().len())
            .field("open_bufctx", &self.inner.open_bufctx.borrow().len())
            .finish()
    }
}
