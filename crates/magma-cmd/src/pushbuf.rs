//! # Push Buffers
//!
//! A push buffer batches command words into a small pool of rotating GART
//! buffers, tracks every buffer the batch references, and hands finished
//! batches to its hardware queue.
//!
//! ## Write cursor
//!
//! ```text
//!  active buffer (words)
//! ┌─────────────┬────────────────┬─────────────┬──────────┬────┐
//! │ finalized   │ open range     │ free        │ kick     │ 2  │
//! │ ranges      │ bgn ─────▶ cur │        end ◀│ reserve  │    │
//! └─────────────┴────────────────┴─────────────┴──────────┴────┘
//! ```
//!
//! Words between `bgn` and `cur` become a command range of the current
//! record when the range is finalized: on submission, on a buffer switch, or
//! before an indirect range in another buffer.
//!
//! ## Modes
//!
//! - **Immediate**: bound to a GPFIFO channel. A flush submits the record
//!   and clears it; the buffer pool wraps around.
//! - **Deferred**: no bound channel. A flush seals the record and starts a
//!   new one; [`Pushbuf::kick`] replays every sealed record. Exhausting the
//!   pool allocates fresh buffers instead of wrapping.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{RefCell, RefMut};
use core::fmt;

use magma_core::{ByteSize, Error, Result};
use magma_mem::{BoAllocator, BoFlags, BufferObject};

use crate::bufctx::BufferContext;
use crate::channel::FifoChannel;
use crate::client::{Client, KrefOwner, PushbufId};
use crate::cmdlist::{BUILTIN_ALIGN, BUILTIN_CMDBUF_SIZE, CmdlistLayout};
use crate::gpfifo::{GpuQueue, MAX_ENTRY_WORDS, QueueFactory};
use crate::record::{DomainLimits, Kref, KrecPush, KrefTxn, MAX_PUSH, RecordQueue};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Push buffer configuration
#[derive(Debug, Clone)]
pub struct PushbufConfig {
    /// Buffers in the rotating pool
    pub nr_buffers: u32,
    /// Size of each pool buffer
    pub buffer_size: ByteSize,
    /// Bind to the channel and submit on flush
    pub immediate: bool,
    /// Video memory one record may reference
    pub vram_limit: Option<ByteSize>,
    /// GART memory one record may reference
    pub gart_limit: Option<ByteSize>,
}

impl PushbufConfig {
    /// Immediate push buffer with four 512 KiB buffers
    pub const fn immediate() -> Self {
        Self {
            nr_buffers: 4,
            buffer_size: ByteSize::from_kib(512),
            immediate: true,
            vram_limit: None,
            gart_limit: None,
        }
    }

    /// Deferred push buffer with four 512 KiB buffers
    pub const fn deferred() -> Self {
        Self {
            immediate: false,
            ..Self::immediate()
        }
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        if self.nr_buffers == 0 {
            return Err(Error::InvalidParameter);
        }
        let size = self.buffer_size.as_bytes();
        if size < ByteSize::KIB_4.as_bytes() || size % 4 != 0 {
            return Err(Error::InvalidParameter);
        }
        // One finalized range must fit in a single GPFIFO entry
        if size / 4 > MAX_ENTRY_WORDS as u64 {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    fn limits(&self) -> DomainLimits {
        DomainLimits {
            vram: self.vram_limit,
            gart: self.gart_limit,
        }
    }
}

impl Default for PushbufConfig {
    fn default() -> Self {
        Self::immediate()
    }
}

/// Flags a push buffer references its own command buffers with
pub const PUSH_FLAGS: BoFlags = BoFlags::RD.union(BoFlags::GART).union(BoFlags::MAP);

/// Words kept free at the end of every command buffer
const SUFFIX_WORDS: u32 = 2;

// =============================================================================
// STATISTICS
// =============================================================================

/// Push buffer statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct PushbufStats {
    /// Flushes, explicit or forced
    pub flushes: u64,
    /// Records accepted by the queue
    pub kickoffs: u64,
    /// Records rejected by the queue
    pub rejected: u64,
    /// Command buffer switches
    pub rotations: u64,
    /// Command buffers allocated beyond the pool
    pub allocations: u64,
}

// =============================================================================
// CLIENT INTERFACE
// =============================================================================

/// A buffer and the access a batch needs to it
#[derive(Debug, Clone)]
pub struct PushRef {
    /// Buffer
    pub bo: BufferObject,
    /// Access and placement flags
    pub flags: BoFlags,
}

impl PushRef {
    /// Create a reference request
    pub fn new(bo: &BufferObject, flags: BoFlags) -> Self {
        Self {
            bo: bo.clone(),
            flags,
        }
    }
}

/// Command word sink at the push buffer's cursor
pub trait CommandStream {
    /// Write one word
    fn emit(&mut self, word: u32) -> Result<()>;

    /// Write consecutive words
    fn emit_slice(&mut self, words: &[u32]) -> Result<()>;

    /// Words left before the end of the usable space
    fn remaining(&self) -> u32;
}

/// Hook run right before a submission, with access to the command stream
pub type KickNotify = Box<dyn FnMut(&mut dyn CommandStream)>;

// =============================================================================
// STATE
// =============================================================================

pub(crate) struct PushbufState {
    pub(crate) id: PushbufId,
    pub(crate) client: Client,
    /// Bound channel; `None` for deferred push buffers
    pub(crate) channel: Option<FifoChannel>,
    pub(crate) config: PushbufConfig,
    pub(crate) limits: DomainLimits,
    pub(crate) queue: Box<dyn GpuQueue>,
    pub(crate) layout: CmdlistLayout,
    pub(crate) records: RecordQueue,
    pub(crate) stats: PushbufStats,
    pub(crate) kick_notify: Option<KickNotify>,

    /// Rotating pool
    bos: Vec<BufferObject>,
    bo_next: usize,
    cmdbuf: BufferObject,
    zcull: BufferObject,

    /// Active command buffer
    bo: Option<BufferObject>,
    /// Start of the open range
    bgn: u32,
    /// Write cursor
    cur: u32,
    /// End of usable space
    end: u32,
    rsvd_kick: u32,

    bufctx: Option<BufferContext>,
}

impl PushbufState {
    // =========================================================================
    // References
    // =========================================================================

    /// Reference `bo` in the current record, returning its index
    fn kref(&mut self, bo: &BufferObject, flags: BoFlags) -> Result<u32> {
        self.client.flush_owner(bo.id(), self.id)?;

        let krec = self.records.current_mut();
        if let Some(index) = self.client.kref_get(bo.id(), self.id) {
            match krec.kref_mut(index) {
                Some(kref) if kref.bo.ptr_eq(bo) => {
                    kref.accumulate(flags);
                    return Ok(index);
                }
                _ => log::warn!("pushbuf {:?}: stale reference to {:?}", self.id, bo.id()),
            }
        }

        let index = krec.add_kref(bo, flags, &self.limits)?;
        self.client.kref_set(
            bo.id(),
            Some(KrefOwner {
                push: self.id,
                index,
            }),
        );
        Ok(index)
    }

    /// Drop released references and their table entries
    pub(crate) fn release(&mut self, krefs: Vec<Kref>) {
        for kref in krefs {
            self.client.kref_release(kref.handle, self.id);
        }
    }

    fn rollback(&mut self, txn: KrefTxn) {
        let released = txn.rollback(self.records.current_mut());
        log::trace!("pushbuf {:?}: rolled back {} references", self.id, released.len());
        self.release(released);
    }

    /// Reference `bo` as part of a batch `txn` can undo
    fn kref_in(&mut self, txn: &mut KrefTxn, bo: &BufferObject, flags: BoFlags) -> Result<u32> {
        if let Some(index) = self.client.kref_get(bo.id(), self.id) {
            txn.touch(self.records.current(), index);
        }
        self.kref(bo, flags)
    }

    fn refn(&mut self, retry: bool, refs: &[PushRef]) -> Result<()> {
        let mut txn = KrefTxn::begin(self.records.current());

        let mut ret = Ok(());
        for r in refs {
            if let Err(e) = self.kref_in(&mut txn, &r.bo, r.flags) {
                ret = Err(e);
                break;
            }
        }

        if let Err(e) = ret {
            self.rollback(txn);
            if retry && e.is_capacity() {
                if let Err(e) = self.flush() {
                    log::warn!("pushbuf {:?}: flush before retry failed: {}", self.id, e);
                }
                self.space(0, 0, 0)?;
                return self.refn(false, refs);
            }
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn validate(&mut self, retry: bool) -> Result<()> {
        let relocs = self
            .bufctx
            .as_ref()
            .map_or(0, |ctx| ctx.relocs().saturating_mul(2));
        // A flush in here folds the contexts back into pending, which the
        // loop below references anyway.
        self.reserve(relocs, relocs, 0)?;

        let Some(ctx) = self.bufctx.clone() else {
            return Ok(());
        };

        let mut txn = KrefTxn::begin(self.records.current());
        self.client.open_bufctx(self.id, &ctx);

        let mut ret = Ok(());
        for (bo, flags) in ctx.pending() {
            if let Err(e) = self.kref_in(&mut txn, &bo, flags) {
                ret = Err(e);
                break;
            }
        }
        ctx.commit_pending();

        if let Err(e) = ret {
            self.rollback(txn);
            if retry && e.is_capacity() {
                log::debug!("pushbuf {:?}: validation out of space, flushing", self.id);
                if let Err(e) = self.flush() {
                    log::warn!("pushbuf {:?}: flush before retry failed: {}", self.id, e);
                }
                return self.validate(false);
            }
            return Err(e);
        }
        Ok(())
    }

    fn refd(&self, bo: &BufferObject) -> BoFlags {
        self.client
            .kref_get(bo.id(), self.id)
            .and_then(|index| self.records.current().kref(index))
            .map_or(BoFlags::empty(), Kref::access)
    }

    // =========================================================================
    // Command ranges
    // =========================================================================

    /// Turn the open range of the active buffer into a command range
    pub(crate) fn finalize_range(&mut self) -> Result<()> {
        if self.bgn == self.cur {
            return Ok(());
        }
        let Some(bo) = self.bo.clone() else {
            return Ok(());
        };

        let bo_index = self.kref(&bo, PUSH_FLAGS)?;
        self.records.current_mut().add_push(KrecPush {
            bo_index,
            offset: self.bgn as u64 * 4,
            length: (self.cur - self.bgn) as u64 * 4,
        })?;
        self.bgn = self.cur;
        Ok(())
    }

    fn data(&mut self, bo: &BufferObject, offset: u64, length: u64) -> Result<()> {
        if offset % 4 != 0 || length % 4 != 0 {
            return Err(Error::InvalidParameter);
        }
        if offset.checked_add(length).is_none_or(|end| end > bo.size().as_bytes()) {
            return Err(Error::BufferOverflow);
        }
        if length > MAX_ENTRY_WORDS as u64 * 4 {
            return Err(Error::BufferOverflow);
        }

        if !self.bo.as_ref().is_some_and(|active| active.ptr_eq(bo)) {
            self.finalize_range()?;
        }

        let bo_index = self
            .client
            .kref_get(bo.id(), self.id)
            .ok_or(Error::NotFound)?;
        self.records.current_mut().add_push(KrecPush {
            bo_index,
            offset,
            length,
        })
    }

    // =========================================================================
    // Space
    // =========================================================================

    pub(crate) fn space(&mut self, dwords: u32, relocs: u32, pushes: u32) -> Result<()> {
        if self.reserve(dwords, relocs, pushes)? {
            self.validate(false)
        } else {
            Ok(())
        }
    }

    /// Words a fresh command buffer offers before the kick reserve
    fn usable_dwords(&self) -> u32 {
        let words = u32::try_from(self.config.buffer_size.as_dwords()).unwrap_or(u32::MAX);
        words.saturating_sub(SUFFIX_WORDS + self.rsvd_kick)
    }

    /// Make room without revalidating; returns whether a flush was required
    fn reserve(&mut self, dwords: u32, relocs: u32, pushes: u32) -> Result<bool> {
        log::trace!(
            "pushbuf {:?}: space {} dwords {} relocs {} pushes",
            self.id,
            dwords,
            relocs,
            pushes
        );

        if dwords > self.usable_dwords() {
            log::warn!(
                "pushbuf {:?}: {} dwords never fit in a {} buffer",
                self.id,
                dwords,
                self.config.buffer_size
            );
            return Err(Error::BufferOverflow);
        }

        let mut next = None;
        if self.cur.saturating_add(dwords) >= self.end {
            if self.bo_next < self.bos.len() {
                next = Some(self.bos[self.bo_next].clone());
                self.bo_next += 1;
                if self.bo_next == self.bos.len() && self.channel.is_some() {
                    self.bo_next = 0;
                }
            } else {
                let bo = self
                    .client
                    .allocator()
                    .bo_new(BoFlags::GART, 0, self.config.buffer_size)?;
                self.stats.allocations += 1;
                next = Some(bo);
            }
        }

        // Room for the range the open write becomes
        let pushes = pushes as usize + 1;

        let mut must_flush = match &next {
            Some(bo) => self.channel.is_some() || self.kref(bo, PUSH_FLAGS).is_err(),
            None => false,
        };
        must_flush |= self.records.current().nr_push() + pushes >= MAX_PUSH;

        let mut flushed = Ok(());
        if must_flush && self.bo.is_some() && self.records.current().nr_buffer() > 0 {
            flushed = self.flush();
        }

        if let Some(bo) = next {
            self.client.allocator().bo_map(&bo, BoFlags::WR)?;
            self.finalize_range()?;

            self.end = bo.size_dwords().saturating_sub(SUFFIX_WORDS + self.rsvd_kick);
            self.bgn = 0;
            self.cur = 0;
            self.bo = Some(bo);
            self.stats.rotations += 1;
        }

        if let Some(bo) = self.bo.clone() {
            self.kref(&bo, PUSH_FLAGS)?;
        }

        flushed?;
        Ok(must_flush)
    }
}

impl CommandStream for PushbufState {
    fn emit(&mut self, word: u32) -> Result<()> {
        self.emit_slice(&[word])
    }

    fn emit_slice(&mut self, words: &[u32]) -> Result<()> {
        let bo = self.bo.as_ref().ok_or(Error::InvalidState)?;
        let count = u32::try_from(words.len()).map_err(|_| Error::BufferOverflow)?;
        bo.write(self.cur, words)?;
        self.cur += count;
        Ok(())
    }

    fn remaining(&self) -> u32 {
        self.end.saturating_sub(self.cur)
    }
}

impl Drop for PushbufState {
    fn drop(&mut self) {
        self.queue.close();

        let mut released = 0;
        for mut krec in self.records.drain() {
            let krefs = krec.reset();
            released += krefs.len();
            self.release(krefs);
        }

        self.client.fold_bufctx(self.id);
        self.client.unregister(self.id);

        log::debug!(
            "pushbuf {:?}: destroyed, released {} references",
            self.id,
            released
        );
    }
}

// =============================================================================
// PUSH BUFFER
// =============================================================================

/// A push buffer owned by one client
///
/// Operations that change state fail with [`Error::Busy`] while the push
/// buffer is mid-operation, for instance when called from its own kick hook.
/// The inspection methods borrow the state and must not be called from there.
pub struct Pushbuf {
    state: Rc<RefCell<PushbufState>>,
}

impl Pushbuf {
    /// Create a push buffer
    ///
    /// Allocates the buffer pool, the builtin command buffer and the zcull
    /// context, creates the hardware queue and writes the administrative
    /// command lists. Immediate push buffers bind to `chan`, which must be a
    /// GPFIFO channel.
    pub fn new(
        client: &Client,
        factory: &dyn QueueFactory,
        chan: &FifoChannel,
        config: PushbufConfig,
    ) -> Result<Self> {
        config.validate()?;
        if config.immediate {
            chan.check_fifo()?;
        }

        let alloc = client.allocator();
        let bos = (0..config.nr_buffers)
            .map(|_| alloc.bo_new(BoFlags::GART, 0, config.buffer_size))
            .collect::<Result<Vec<_>>>()?;

        let cmdbuf = alloc
            .bo_new(BoFlags::GART, BUILTIN_ALIGN, BUILTIN_CMDBUF_SIZE)
            .inspect_err(|e| log::debug!("failed to create builtin cmdbuf: {}", e))?;
        let zcull = alloc
            .bo_new(BoFlags::GART, BUILTIN_ALIGN, factory.zcull_ctx_size())
            .inspect_err(|e| log::debug!("failed to create zcull context: {}", e))?;

        let mut queue = factory.create_queue().map_err(|status| {
            log::debug!("failed to create GPU channel: {}", status);
            Error::QueueError(status.0)
        })?;

        let layout = match Self::bind_queue(alloc, &mut *queue, &cmdbuf, &zcull) {
            Ok(layout) => layout,
            Err(e) => {
                queue.close();
                return Err(e);
            }
        };

        let id = client.alloc_pushbuf_id();
        let state = PushbufState {
            id,
            client: client.clone(),
            channel: config.immediate.then_some(*chan),
            limits: config.limits(),
            config,
            queue,
            layout,
            records: RecordQueue::new(),
            stats: PushbufStats::default(),
            kick_notify: None,
            bos,
            bo_next: 0,
            cmdbuf,
            zcull,
            bo: None,
            bgn: 0,
            cur: 0,
            end: 0,
            rsvd_kick: 0,
            bufctx: None,
        };

        let state = Rc::new(RefCell::new(state));
        client.register(id, Rc::downgrade(&state));

        {
            let s = state.borrow();
            log::debug!(
                "pushbuf {:?}: {} x {} {} on syncpoint {}",
                id,
                s.config.nr_buffers,
                s.config.buffer_size,
                if s.config.immediate { "immediate" } else { "deferred" },
                s.queue.syncpoint_id()
            );
        }

        Ok(Self { state })
    }

    fn bind_queue(
        alloc: &dyn BoAllocator,
        queue: &mut dyn GpuQueue,
        cmdbuf: &BufferObject,
        zcull: &BufferObject,
    ) -> Result<CmdlistLayout> {
        queue.bind_zcull(zcull.addr()).map_err(|status| {
            log::debug!("failed to bind zcull context: {}", status);
            Error::QueueError(status.0)
        })?;
        alloc.bo_map(cmdbuf, BoFlags::WR)?;
        CmdlistLayout::write(cmdbuf, queue.syncpoint_id())
    }

    fn state(&self) -> Result<RefMut<'_, PushbufState>> {
        self.state.try_borrow_mut().map_err(|_| Error::Busy)
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Get push buffer ID
    pub fn id(&self) -> PushbufId {
        self.state.borrow().id
    }

    /// Check if flushes submit immediately
    pub fn is_immediate(&self) -> bool {
        self.state.borrow().channel.is_some()
    }

    /// Attach a buffer context, returning the previous one
    pub fn set_bufctx(&self, ctx: Option<BufferContext>) -> Result<Option<BufferContext>> {
        Ok(core::mem::replace(&mut self.state()?.bufctx, ctx))
    }

    /// Install the hook run before every submission
    pub fn set_kick_notify(&self, notify: Option<KickNotify>) -> Result<()> {
        self.state()?.kick_notify = notify;
        Ok(())
    }

    /// Keep `dwords` free at the end of each command buffer for the kick hook
    ///
    /// Takes effect at the next buffer switch.
    pub fn set_kick_reserve(&self, dwords: u32) -> Result<()> {
        self.state()?.rsvd_kick = dwords;
        Ok(())
    }

    // =========================================================================
    // Writing commands
    // =========================================================================

    /// Make room for `dwords` words, `relocs` relocations and `pushes` ranges
    ///
    /// May switch command buffers and flush.
    pub fn space(&self, dwords: u32, relocs: u32, pushes: u32) -> Result<()> {
        self.state()?.space(dwords, relocs, pushes)
    }

    /// Write one word at the cursor
    pub fn emit(&self, word: u32) -> Result<()> {
        self.state()?.emit(word)
    }

    /// Write words at the cursor
    pub fn emit_slice(&self, words: &[u32]) -> Result<()> {
        self.state()?.emit_slice(words)
    }

    /// Words left before the end of the usable space
    pub fn remaining(&self) -> u32 {
        self.state.borrow().remaining()
    }

    /// Submit `length` bytes at `offset` of a referenced buffer as a range
    pub fn data(&self, bo: &BufferObject, offset: u64, length: u64) -> Result<()> {
        self.state()?.data(bo, offset, length)
    }

    // =========================================================================
    // References
    // =========================================================================

    /// Reference every buffer in `refs`, all or none
    ///
    /// Runs out of space at most once: the record is flushed and the batch
    /// retried. A failed batch leaves the record as it found it, access
    /// flags of buffers it already referenced included.
    pub fn refn(&self, refs: &[PushRef]) -> Result<()> {
        self.state()?.refn(true, refs)
    }

    /// Reference the attached buffer context's pending buffers
    pub fn validate(&self) -> Result<()> {
        self.state()?.validate(true)
    }

    /// Access this push buffer's current record has to `bo`
    pub fn refd(&self, bo: &BufferObject) -> BoFlags {
        self.state.borrow().refd(bo)
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Flush the current record
    pub fn flush(&self) -> Result<()> {
        self.state()?.flush()
    }

    /// Submit pending work
    ///
    /// Immediate push buffers flush and revalidate; deferred ones submit
    /// every sealed record through `chan`.
    pub fn kick(&self, chan: &FifoChannel) -> Result<()> {
        let mut state = self.state()?;
        if state.channel.is_none() {
            return state.submit(chan);
        }

        let flushed = state.flush();
        let validated = state.validate(false);
        flushed.and(validated)
    }

    /// Tear the push buffer down, releasing every reference without
    /// submitting
    pub fn destroy(self) {
        drop(self);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Buffers referenced by the current record
    pub fn nr_buffer(&self) -> usize {
        self.state.borrow().records.current().nr_buffer()
    }

    /// Ranges in the current record
    pub fn nr_push(&self) -> usize {
        self.state.borrow().records.current().nr_push()
    }

    /// Records in the queue, the current one included
    pub fn records_len(&self) -> usize {
        self.state.borrow().records.len()
    }

    /// Command buffer being written
    pub fn active_buffer(&self) -> Option<BufferObject> {
        self.state.borrow().bo.clone()
    }

    /// Pool buffer `index`
    pub fn pool_buffer(&self, index: usize) -> Option<BufferObject> {
        self.state.borrow().bos.get(index).cloned()
    }

    /// Buffer holding the administrative command lists
    pub fn cmdbuf(&self) -> BufferObject {
        self.state.borrow().cmdbuf.clone()
    }

    /// Zcull context buffer
    pub fn zcull_ctx(&self) -> BufferObject {
        self.state.borrow().zcull.clone()
    }

    /// Administrative command list layout
    pub fn cmdlist_layout(&self) -> CmdlistLayout {
        self.state.borrow().layout
    }

    /// Write cursor and end of usable space, in words
    pub fn cursor(&self) -> (u32, u32) {
        let state = self.state.borrow();
        (state.cur, state.end)
    }

    /// Get statistics
    pub fn stats(&self) -> PushbufStats {
        self.state.borrow().stats
    }
}

impl fmt::Debug for Pushbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Pushbuf")
            .field("id", &state.id)
            .field("immediate", &state.channel.is_some())
            .field("records", &state.records.len())
            .field("cur", &state.cur)
            .field("end", &state.end)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdlist::fence_cmdlist;
    use crate::record::MAX_BUFFERS;
    use crate::soft::SoftQueueFactory;
    use magma_mem::{SysmemAllocator, SysmemConfig};

    struct Rig {
        mem: Rc<SysmemAllocator>,
        client: Client,
        queues: SoftQueueFactory,
    }

    fn rig() -> Rig {
        let mem = Rc::new(SysmemAllocator::new(SysmemConfig::small()));
        Rig {
            client: Client::new(mem.clone()),
            mem,
            queues: SoftQueueFactory::default(),
        }
    }

    fn small(immediate: bool) -> PushbufConfig {
        PushbufConfig {
            nr_buffers: 2,
            buffer_size: ByteSize::KIB_4,
            immediate,
            ..PushbufConfig::default()
        }
    }

    impl Rig {
        fn pushbuf(&self, config: PushbufConfig) -> Pushbuf {
            Pushbuf::new(&self.client, &self.queues, &FifoChannel::new(1), config).unwrap()
        }

        fn bos(&self, n: usize) -> Vec<BufferObject> {
            (0..n)
                .map(|_| self.mem.bo_new(BoFlags::GART, 0, ByteSize::KIB_4).unwrap())
                .collect()
        }
    }

    #[test]
    fn test_new_sets_up_queue() {
        let r = rig();
        let push = r.pushbuf(small(true));
        let q = r.queues.queue(0).unwrap();

        assert_eq!(q.zcull_ctx(), Some(push.zcull_ctx().addr()));
        assert!(push.cmdbuf().addr().is_aligned(BUILTIN_ALIGN));
        assert_eq!(push.cmdbuf().read(0, 3).unwrap(), fence_cmdlist(20));
        assert!(push.is_immediate());
        assert_eq!(r.client.pushbuf_count(), 1);

        drop(push);
        assert!(q.is_closed());
        assert_eq!(r.client.pushbuf_count(), 0);
    }

    #[test]
    fn test_new_rejects_bad_setup() {
        let r = rig();
        let copy = FifoChannel::with_class(0xc6b5, 1);
        assert_eq!(
            Pushbuf::new(&r.client, &r.queues, &copy, small(true)).unwrap_err(),
            Error::InvalidChannelClass
        );
        assert!(Pushbuf::new(&r.client, &r.queues, &copy, small(false)).is_ok());

        let empty = PushbufConfig {
            nr_buffers: 0,
            ..small(true)
        };
        assert_eq!(
            Pushbuf::new(&r.client, &r.queues, &FifoChannel::new(1), empty).unwrap_err(),
            Error::InvalidParameter
        );

        r.queues.fail_next_create(7);
        assert_eq!(
            Pushbuf::new(&r.client, &r.queues, &FifoChannel::new(1), small(true)).unwrap_err(),
            Error::QueueError(7)
        );

        r.mem.fail_next_map();
        assert_eq!(
            Pushbuf::new(&r.client, &r.queues, &FifoChannel::new(1), small(true)).unwrap_err(),
            Error::MappingFailed
        );
        assert!(r.queues.queue(1).unwrap().is_closed());
    }

    #[test]
    fn test_emit_needs_space() {
        let r = rig();
        let push = r.pushbuf(small(true));
        assert_eq!(push.emit(1), Err(Error::InvalidState));

        push.space(8, 0, 0).unwrap();
        assert_eq!(push.cursor(), (0, 1022));
        push.emit_slice(&[1, 2, 3]).unwrap();
        assert_eq!(push.remaining(), 1019);
        assert_eq!(push.emit_slice(&[0; 1022]), Err(Error::BufferOverflow));
        assert_eq!(push.active_buffer().unwrap().read(0, 3).unwrap(), [1, 2, 3]);
    }

    #[test]
    fn test_flags_accumulate() {
        let r = rig();
        let push = r.pushbuf(small(true));
        let bo = &r.bos(1)[0];

        push.space(16, 0, 0).unwrap();
        push.refn(&[PushRef::new(bo, BoFlags::RD)]).unwrap();
        push.refn(&[PushRef::new(bo, BoFlags::WR)]).unwrap();

        assert_eq!(push.refd(bo), BoFlags::RDWR);
        assert_eq!(push.nr_buffer(), 2);
        assert_eq!(bo.ref_count(), 2);
        assert_eq!(r.client.push_get(bo.id()), Some(push.id()));
    }

    #[test]
    fn test_refn_capacity_rolls_back() {
        let r = rig();
        let push = r.pushbuf(small(true));
        push.space(16, 0, 0).unwrap();

        let bos = r.bos(MAX_BUFFERS + 1);
        let refs: Vec<_> = bos.iter().map(|bo| PushRef::new(bo, BoFlags::RD)).collect();
        assert_eq!(push.refn(&refs), Err(Error::NoSpace));

        assert_eq!(push.nr_buffer(), 1);
        assert!(bos.iter().all(|bo| bo.ref_count() == 1));
        assert!(bos.iter().all(|bo| push.refd(bo).is_empty()));
        assert_eq!(r.client.tracked_buffers(), 1);
    }

    #[test]
    fn test_refn_retries_after_flush() {
        let r = rig();
        let push = r.pushbuf(small(true));
        push.space(16, 0, 0).unwrap();

        let first = r.bos(1000);
        let second = r.bos(100);
        let refs = |bos: &[BufferObject]| -> Vec<PushRef> {
            bos.iter().map(|bo| PushRef::new(bo, BoFlags::RD)).collect()
        };

        push.refn(&refs(&first)).unwrap();
        assert_eq!(push.nr_buffer(), 1001);

        push.refn(&refs(&second)).unwrap();
        assert_eq!(push.nr_buffer(), 101);
        assert_eq!(first[0].ref_count(), 1);
        assert_eq!(second[99].ref_count(), 2);
        assert_eq!(push.stats().flushes, 1);
    }

    #[test]
    fn test_domain_limit_rejects_overcommit() {
        let r = rig();
        let push = r.pushbuf(PushbufConfig {
            gart_limit: Some(ByteSize::from_kib(8)),
            ..small(true)
        });
        push.space(16, 0, 0).unwrap();

        let bos = r.bos(2);
        let refs = [
            PushRef::new(&bos[0], BoFlags::RD),
            PushRef::new(&bos[1], BoFlags::RD),
        ];
        assert_eq!(push.refn(&refs), Err(Error::NoSpace));
        assert_eq!(push.nr_buffer(), 1);
        assert!(push.refd(&bos[0]).is_empty());

        push.refn(&refs[..1]).unwrap();
        assert_eq!(push.refd(&bos[0]), BoFlags::RD);
    }

    #[test]
    fn test_steal_flushes_owner() {
        let r = rig();
        let a = r.pushbuf(small(true));
        let b = r.pushbuf(small(true));
        let bo = &r.bos(1)[0];

        a.space(8, 0, 0).unwrap();
        a.emit(0x1234).unwrap();
        a.refn(&[PushRef::new(bo, BoFlags::WR)]).unwrap();
        assert_eq!(r.client.push_get(bo.id()), Some(a.id()));

        b.space(8, 0, 0).unwrap();
        b.refn(&[PushRef::new(bo, BoFlags::RD)]).unwrap();

        assert_eq!(r.client.push_get(bo.id()), Some(b.id()));
        assert!(a.refd(bo).is_empty());
        assert_eq!(b.refd(bo), BoFlags::RD);
        assert_eq!(a.nr_buffer(), 0);

        let qa = r.queues.queue(0).unwrap();
        assert_eq!(qa.kickoff_count(), 1);
        assert_eq!(bo.access(), BoFlags::WR);
        assert!(bo.fence().is_valid());
        assert_eq!(r.queues.queue(1).unwrap().kickoff_count(), 0);
    }

    #[test]
    fn test_rotation_wraps_when_immediate() {
        let r = rig();
        let push = r.pushbuf(small(true));
        let q = r.queues.queue(0).unwrap();

        push.space(16, 0, 0).unwrap();
        assert_eq!(push.active_buffer(), push.pool_buffer(0));
        push.emit_slice(&[0; 1000]).unwrap();

        push.space(100, 0, 0).unwrap();
        assert_eq!(push.active_buffer(), push.pool_buffer(1));
        assert_eq!(push.cursor(), (0, 1022));
        assert_eq!(q.kickoff_count(), 1);
        assert_eq!(q.kickoffs()[0].entries[0].num_cmds(), 1000);

        push.emit_slice(&[0; 1000]).unwrap();
        push.space(100, 0, 0).unwrap();
        assert_eq!(push.active_buffer(), push.pool_buffer(0));
        assert_eq!(q.kickoff_count(), 2);

        let stats = push.stats();
        assert_eq!(stats.rotations, 3);
        assert_eq!(stats.allocations, 0);
    }

    #[test]
    fn test_rotation_allocates_when_deferred() {
        let r = rig();
        let push = r.pushbuf(small(false));

        push.space(16, 0, 0).unwrap();
        push.emit_slice(&[0; 1000]).unwrap();
        push.space(100, 0, 0).unwrap();
        assert_eq!(push.active_buffer(), push.pool_buffer(1));
        push.emit_slice(&[0; 1000]).unwrap();
        push.space(100, 0, 0).unwrap();

        let active = push.active_buffer().unwrap();
        assert_ne!(Some(active.clone()), push.pool_buffer(0));
        assert_ne!(Some(active), push.pool_buffer(1));
        assert_eq!(push.stats().allocations, 1);
        assert_eq!(push.nr_push(), 2);
        assert_eq!(push.records_len(), 1);
        assert_eq!(r.queues.queue(0).unwrap().kickoff_count(), 0);
    }

    #[test]
    fn test_push_limit_forces_flush() {
        let r = rig();
        let push = r.pushbuf(small(true));
        let bo = &r.bos(1)[0];

        push.space(16, 0, 0).unwrap();
        push.refn(&[PushRef::new(bo, BoFlags::RD)]).unwrap();
        for _ in 0..MAX_PUSH - 1 {
            push.data(bo, 0, 4).unwrap();
        }
        push.space(0, 0, 0).unwrap();

        let q = r.queues.queue(0).unwrap();
        assert_eq!(q.kickoff_count(), 1);
        assert_eq!(q.kickoffs()[0].entries.len(), MAX_PUSH);
        assert_eq!(push.nr_push(), 0);
    }

    #[test]
    fn test_data_checks_range() {
        let r = rig();
        let push = r.pushbuf(small(true));
        let bo = &r.bos(1)[0];
        push.space(16, 0, 0).unwrap();

        assert_eq!(push.data(bo, 0, 16), Err(Error::NotFound));
        push.refn(&[PushRef::new(bo, BoFlags::RD)]).unwrap();
        assert_eq!(push.data(bo, 2, 16), Err(Error::InvalidParameter));
        assert_eq!(push.data(bo, 4092, 8), Err(Error::BufferOverflow));

        push.emit(7).unwrap();
        push.data(bo, 0x40, 0x20).unwrap();
        assert_eq!(push.nr_push(), 2);
    }

    #[test]
    fn test_validate_bufctx() {
        let r = rig();
        let push = r.pushbuf(small(true));
        let bos = r.bos(2);
        let ctx = BufferContext::new(1).unwrap();
        ctx.refn(0, &bos[0], BoFlags::RD).unwrap();
        ctx.mthd(0, &bos[1], BoFlags::WR).unwrap();

        assert!(push.set_bufctx(Some(ctx.clone())).unwrap().is_none());
        push.validate().unwrap();
        assert_eq!(push.refd(&bos[0]), BoFlags::RD);
        assert_eq!(push.refd(&bos[1]), BoFlags::WR);
        assert_eq!(ctx.pending_len(), 0);
        assert_eq!(ctx.current_len(), 2);
        assert_eq!(r.client.open_bufctx_count(), 1);

        push.flush().unwrap();
        assert!(push.refd(&bos[0]).is_empty());
        assert_eq!(ctx.pending_len(), 2);
        assert_eq!(r.client.open_bufctx_count(), 0);

        push.validate().unwrap();
        assert_eq!(push.refd(&bos[1]), BoFlags::WR);
    }

    #[test]
    fn test_validate_retries_after_flush() {
        let r = rig();
        let push = r.pushbuf(small(true));
        push.space(16, 0, 0).unwrap();

        let filler = r.bos(MAX_BUFFERS - 2);
        let refs: Vec<_> = filler.iter().map(|bo| PushRef::new(bo, BoFlags::RD)).collect();
        push.refn(&refs).unwrap();
        assert_eq!(push.nr_buffer(), MAX_BUFFERS - 1);

        let ctx_bos = r.bos(3);
        let ctx = BufferContext::new(1).unwrap();
        for bo in &ctx_bos {
            ctx.refn(0, bo, BoFlags::RD).unwrap();
        }
        push.set_bufctx(Some(ctx.clone())).unwrap();
        push.validate().unwrap();

        assert_eq!(push.nr_buffer(), 4);
        assert_eq!(filler[0].ref_count(), 1);
        assert!(ctx_bos.iter().all(|bo| push.refd(bo) == BoFlags::RD));
        assert_eq!(ctx.current_len(), 3);
    }

    #[test]
    fn test_config_bounds_buffer_size() {
        let huge = PushbufConfig {
            buffer_size: ByteSize::from_mib(16),
            ..PushbufConfig::default()
        };
        assert_eq!(huge.validate(), Err(Error::InvalidParameter));
        assert!(PushbufConfig::deferred().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_bufctx() {
        let r = rig();
        let push = r.pushbuf(small(true));
        let bo = &r.bos(1)[0];
        let ctx = BufferContext::new(1).unwrap();
        for _ in 0..600 {
            ctx.mthd(0, bo, BoFlags::RD).unwrap();
        }
        push.set_bufctx(Some(ctx.clone())).unwrap();

        assert_eq!(push.validate(), Err(Error::BufferOverflow));
        assert_eq!(push.stats().rotations, 0);
        assert_eq!(ctx.pending_len(), 600);

        ctx.reset(0);
        for _ in 0..400 {
            ctx.mthd(0, bo, BoFlags::RD).unwrap();
        }
        push.validate().unwrap();
        assert_eq!(push.refd(bo), BoFlags::RD);
        assert_eq!(push.stats().rotations, 1);
    }

    #[test]
    fn test_space_rejects_request_larger_than_buffer() {
        let r = rig();
        let push = r.pushbuf(small(true));
        push.set_kick_reserve(2).unwrap();

        assert_eq!(push.space(1021, 0, 0), Err(Error::BufferOverflow));
        push.space(1020, 0, 0).unwrap();
        assert_eq!(push.cursor(), (0, 1020));
    }

    #[test]
    fn test_failed_refn_keeps_prior_access() {
        let r = rig();
        let push = r.pushbuf(PushbufConfig {
            gart_limit: Some(ByteSize::from_kib(8)),
            ..small(true)
        });
        let bos = r.bos(2);

        push.space(8, 0, 0).unwrap();
        push.emit(1).unwrap();
        push.refn(&[PushRef::new(&bos[0], BoFlags::RD)]).unwrap();

        let refs = [
            PushRef::new(&bos[0], BoFlags::WR),
            PushRef::new(&bos[1], BoFlags::RD),
        ];
        assert_eq!(push.refn(&refs), Err(Error::NoSpace));

        // The retry flushed the record with the access it had before
        assert_eq!(r.queues.queue(0).unwrap().kickoff_count(), 1);
        assert_eq!(bos[0].access(), BoFlags::RD);
        assert!(push.refd(&bos[0]).is_empty());
    }
}
