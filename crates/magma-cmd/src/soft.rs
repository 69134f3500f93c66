//! # Software Queue
//!
//! A [`GpuQueue`] that records kickoffs instead of handing them to hardware.
//!
//! The queue emulates a syncpoint so fences behave like the real thing, and
//! can be told to reject submissions or fail creation. Every queue created by
//! a [`SoftQueueFactory`] stays inspectable through a [`SoftQueueHandle`]
//! after the push buffer has taken ownership of it.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use magma_core::{ByteSize, Fence, GpuAddr, Syncpoint};

use crate::gpfifo::{GpFifoEntry, GpuQueue, QueueFactory, QueueStatus};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Software queue configuration
#[derive(Debug, Clone)]
pub struct SoftQueueConfig {
    /// Syncpoint ID of the first queue; later queues count up from it
    pub syncpoint_id: u32,
    /// Zcull context size reported by the factory
    pub zcull_ctx_size: ByteSize,
    /// Complete every kickoff immediately
    pub auto_complete: bool,
}

impl Default for SoftQueueConfig {
    fn default() -> Self {
        Self {
            syncpoint_id: 20,
            zcull_ctx_size: ByteSize::from_kib(16),
            auto_complete: true,
        }
    }
}

// =============================================================================
// RECORDED STATE
// =============================================================================

/// One accepted kickoff
#[derive(Debug, Clone)]
pub struct Kickoff {
    /// Entries in submission order
    pub entries: Vec<GpFifoEntry>,
    /// Fence signalled by the batch
    pub fence: Fence,
}

#[derive(Debug)]
struct SoftQueueState {
    syncpt: Syncpoint,
    pending: Vec<GpFifoEntry>,
    pending_incrs: u32,
    fence: Fence,
    kickoffs: Vec<Kickoff>,
    rejected: u32,
    zcull_ctx: Option<GpuAddr>,
    reject_next: Option<QueueStatus>,
    auto_complete: bool,
    closed: bool,
}

/// Inspection handle for a software queue
#[derive(Debug, Clone)]
pub struct SoftQueueHandle {
    state: Rc<RefCell<SoftQueueState>>,
}

impl SoftQueueHandle {
    /// Accepted kickoffs so far
    pub fn kickoffs(&self) -> Vec<Kickoff> {
        self.state.borrow().kickoffs.clone()
    }

    /// Number of accepted kickoffs
    pub fn kickoff_count(&self) -> usize {
        self.state.borrow().kickoffs.len()
    }

    /// Number of rejected kickoffs
    pub fn rejected_count(&self) -> u32 {
        self.state.borrow().rejected
    }

    /// Entries waiting for the next kickoff
    pub fn pending(&self) -> Vec<GpFifoEntry> {
        self.state.borrow().pending.clone()
    }

    /// Bound zcull context, if any
    pub fn zcull_ctx(&self) -> Option<GpuAddr> {
        self.state.borrow().zcull_ctx
    }

    /// Check if the owner closed the queue
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// Current syncpoint value
    pub fn syncpoint_value(&self) -> u32 {
        self.state.borrow().syncpt.value()
    }

    /// Reject the next kickoff with `status`
    pub fn reject_next(&self, status: u32) {
        self.state.borrow_mut().reject_next = Some(QueueStatus(status));
    }

    /// Mark all submitted work as executed
    pub fn complete_all(&self) {
        self.state.borrow().syncpt.complete_all();
    }
}

// =============================================================================
// SOFT QUEUE
// =============================================================================

/// Recording implementation of [`GpuQueue`]
#[derive(Debug)]
pub struct SoftQueue {
    handle: SoftQueueHandle,
}

impl SoftQueue {
    /// Create a standalone queue
    pub fn new(syncpoint_id: u32, auto_complete: bool) -> Self {
        let state = SoftQueueState {
            syncpt: Syncpoint::new(syncpoint_id, 0),
            pending: Vec::new(),
            pending_incrs: 0,
            fence: Fence::NONE,
            kickoffs: Vec::new(),
            rejected: 0,
            zcull_ctx: None,
            reject_next: None,
            auto_complete,
            closed: false,
        };

        Self {
            handle: SoftQueueHandle {
                state: Rc::new(RefCell::new(state)),
            },
        }
    }

    /// Inspection handle
    pub fn handle(&self) -> SoftQueueHandle {
        self.handle.clone()
    }
}

impl GpuQueue for SoftQueue {
    fn append_entry(&mut self, entry: GpFifoEntry) {
        log::trace!("gpfifo: append {:?}", entry);
        self.handle.state.borrow_mut().pending.push(entry);
    }

    fn incr_fence(&mut self) {
        self.handle.state.borrow_mut().pending_incrs += 1;
    }

    fn kickoff(&mut self) -> core::result::Result<(), QueueStatus> {
        let mut state = self.handle.state.borrow_mut();
        if state.closed {
            return Err(QueueStatus(u32::MAX));
        }
        if let Some(status) = state.reject_next.take() {
            state.rejected += 1;
            state.pending.clear();
            state.pending_incrs = 0;
            return Err(status);
        }

        let mut fence = state.syncpt.max_fence();
        for _ in 0..state.pending_incrs {
            fence = state.syncpt.reserve();
        }
        state.pending_incrs = 0;
        state.fence = fence;

        let entries = core::mem::take(&mut state.pending);
        state.kickoffs.push(Kickoff { entries, fence });

        if state.auto_complete {
            state.syncpt.complete_all();
        }
        Ok(())
    }

    fn fence(&self) -> Fence {
        self.handle.state.borrow().fence
    }

    fn syncpoint_id(&self) -> u32 {
        self.handle.state.borrow().syncpt.id()
    }

    fn bind_zcull(&mut self, ctx: GpuAddr) -> core::result::Result<(), QueueStatus> {
        if !ctx.is_aligned(0x1000) {
            return Err(QueueStatus(0xe))
        }
        self.handle.state.borrow_mut().zcull_ctx = Some(ctx);
        Ok(())
    }

    fn pending_entries(&self) -> usize {
        self.handle.state.borrow().pending.len()
    }

    fn close(&mut self) {
        let mut state = self.handle.state.borrow_mut();
        state.closed = true;
        state.pending.clear();
    }
}

// =============================================================================
// FACTORY
// =============================================================================

/// Creates [`SoftQueue`]s and keeps a handle to each
#[derive(Debug, Default)]
pub struct SoftQueueFactory {
    config: SoftQueueConfig,
    queues: RefCell<Vec<SoftQueueHandle>>,
    fail_next: Cell<Option<QueueStatus>>,
}

impl SoftQueueFactory {
    /// Create a factory
    pub fn new(config: SoftQueueConfig) -> Self {
        Self {
            config,
            queues: RefCell::new(Vec::new()),
            fail_next: Cell::new(None),
        }
    }

    /// Handle of the `index`-th created queue
    pub fn queue(&self, index: usize) -> Option<SoftQueueHandle> {
        self.queues.borrow().get(index).cloned()
    }

    /// Number of queues created so far
    pub fn created(&self) -> usize {
        self.queues.borrow().len()
    }

    /// Make the next `create_queue` fail with `status`
    pub fn fail_next_create(&self, status: u32) {
        self.fail_next.set(Some(QueueStatus(status)));
    }
}

impl QueueFactory for SoftQueueFactory {
    fn create_queue(&self) -> core::result::Result<Box<dyn GpuQueue>, QueueStatus> {
        if let Some(status) = self.fail_next.take() {
            return Err(status);
        }

        let mut queues = self.queues.borrow_mut();
        let id = self.config.syncpoint_id + queues.len() as u32;
        let queue = SoftQueue::new(id, self.config.auto_complete);
        queues.push(queue.handle());
        Ok(Box::new(queue))
    }

    fn zcull_ctx_size(&self) -> ByteSize {
        self.config.zcull_ctx_size
    }
}
