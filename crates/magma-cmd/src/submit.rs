//! # Flush and Submit
//!
//! Turning records into GPFIFO entries.
//!
//! Every record is submitted as its command ranges followed by the fence
//! list. Once the queue accepts the batch, the fence is stamped on every
//! buffer the record references, and a cache flush plus a one-word barrier
//! are queued so the next batch observes this one's writes:
//!
//! ```text
//!  kickoff n                              kickoff n+1
//! ┌────────┬─────┬────────┬───────┐      ┌───────┬─────────┬────────┬─────┐
//! │ push 0 │ ... │ push N │ fence │ ───▶ │ flush │ barrier │ push 0 │ ... │
//! └────────┴─────┴────────┴───────┘      └───────┴─────────┴────────┴─────┘
//!   NOT_MAIN                NOT_MAIN       NOT_MAIN NOT_MAIN
//!                           NO_PREFETCH             NO_PREFETCH
//! ```

use magma_core::{Error, Result};

use crate::channel::FifoChannel;
use crate::gpfifo::{EntryFlags, GpFifoEntry, MAX_ENTRY_WORDS};
use crate::pushbuf::PushbufState;
use crate::record::Krec;

impl PushbufState {
    /// Flush the current record
    ///
    /// Immediate push buffers submit and then release the record whatever
    /// the outcome. Deferred push buffers seal it for replay. Either way the
    /// open buffer contexts are folded back for revalidation.
    pub(crate) fn flush(&mut self) -> Result<()> {
        self.stats.flushes += 1;

        let ret = match self.channel {
            Some(chan) => {
                let ret = self.submit(&chan);
                let released = self.records.current_mut().reset();
                self.release(released);
                ret
            }
            None => self.seal(),
        };

        self.client.fold_bufctx(self.id);
        ret
    }

    /// Keep the current record for replay and start a new one
    fn seal(&mut self) -> Result<()> {
        let ret = self.finalize_range();

        let krec = self.records.current_mut();
        if krec.nr_push() == 0 {
            let released = krec.reset();
            self.release(released);
            return ret;
        }

        for kref in krec.buffers() {
            self.client.kref_release(kref.handle, self.id);
        }
        self.records.seal();
        log::debug!(
            "pushbuf {:?}: sealed record, {} queued",
            self.id,
            self.records.len() - 1
        );
        ret
    }

    /// Submit every non-empty record through the queue
    pub(crate) fn submit(&mut self, chan: &FifoChannel) -> Result<()> {
        chan.check_fifo()?;

        if let Some(mut notify) = self.kick_notify.take() {
            notify(self);
            self.kick_notify = Some(notify);
        }

        self.finalize_range()?;

        let chid = chan.chid();
        for (krec_id, krec) in self.records.submittable().enumerate() {
            for push in krec.pushes() {
                let kref = krec.kref(push.bo_index).ok_or(Error::InvalidState)?;
                let words = u32::try_from(push.length / 4)
                    .ok()
                    .filter(|&words| words <= MAX_ENTRY_WORDS)
                    .ok_or(Error::BufferOverflow)?;
                self.queue.append_entry(GpFifoEntry::new(
                    kref.bo.addr().offset(push.offset),
                    words,
                    EntryFlags::NOT_MAIN,
                ));
            }

            self.queue.incr_fence();
            self.queue.append_entry(self.layout.fence_entry());

            log::debug!(
                "ch{}: submitting {} entries",
                chid,
                self.queue.pending_entries()
            );
            if let Err(status) = self.queue.kickoff() {
                log::debug!("ch{}: GPU channel rejected pushbuf: {}", chid, status);
                dump(krec, krec_id, chid);
                self.stats.rejected += 1;
                return Err(Error::SubmissionRejected(status.0));
            }

            let fence = self.queue.fence();
            log::trace!("ch{}: received fence {:?}", chid, fence);
            for kref in krec.buffers() {
                kref.bo.set_fence(fence);
                kref.bo.add_access(kref.access());
            }

            self.queue.append_entry(self.layout.flush_entry());
            self.queue.append_entry(self.layout.barrier_entry());
            self.stats.kickoffs += 1;
        }

        Ok(())
    }
}

/// Log a rejected record
fn dump(krec: &Krec, krec_id: usize, chid: u32) {
    log::debug!(
        "ch{}: krec {} pushes {} bufs {}",
        chid,
        krec_id,
        krec.nr_push(),
        krec.nr_buffer()
    );

    for (i, kref) in krec.buffers().iter().enumerate() {
        log::debug!(
            "ch{}: buf {:08x} {:08x} {:08x} {:08x}",
            chid,
            i,
            kref.handle.id(),
            kref.read_domains.bits(),
            kref.write_domains.bits()
        );
    }

    for push in krec.pushes() {
        log::debug!(
            "ch{}: psh {:08x} {:010x} {:010x}",
            chid,
            push.bo_index,
            push.offset,
            push.offset + push.length
        );

        if !log::log_enabled!(log::Level::Trace) {
            continue;
        }
        let words = krec
            .kref(push.bo_index)
            .and_then(|kref| kref.bo.read((push.offset / 4) as u32, (push.length / 4) as u32).ok());
        for word in words.into_iter().flatten() {
            log::trace!("\t{:#010x}", word);
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::rc::Rc;
    use core::cell::Cell;

    use magma_core::ByteSize;
    use magma_mem::{BoAllocator, BoFlags, BufferObject, SysmemAllocator, SysmemConfig};

    use super::*;
    use crate::client::Client;
    use crate::pushbuf::{CommandStream, PushRef, Pushbuf, PushbufConfig};
    use crate::soft::SoftQueueFactory;

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

    impl Rig {
        fn pushbuf(&self, immediate: bool) -> Pushbuf {
            let config = PushbufConfig {
                nr_buffers: 2,
                buffer_size: ByteSize::KIB_4,
                immediate,
                ..PushbufConfig::default()
            };
            Pushbuf::new(&self.client, &self.queues, &FifoChannel::new(1), config).unwrap()
        }

        fn bo(&self) -> BufferObject {
            self.mem.bo_new(BoFlags::GART, 0, ByteSize::KIB_4).unwrap()
        }
    }

    #[test]
    fn test_kick_submits_ranges_and_fence() {
        let r = rig();
        let push = r.pushbuf(true);
        let chan = FifoChannel::new(1);
        let bo = r.bo();

        push.space(8, 0, 0).unwrap();
        push.emit_slice(&[1, 2, 3, 4]).unwrap();
        push.refn(&[PushRef::new(&bo, BoFlags::RDWR)]).unwrap();
        push.data(&bo, 0x100, 0x40).unwrap();
        push.kick(&chan).unwrap();

        let q = r.queues.queue(0).unwrap();
        let active = push.active_buffer().unwrap();
        let layout = push.cmdlist_layout();
        let kicks = q.kickoffs();
        assert_eq!(kicks.len(), 1);
        assert_eq!(
            kicks[0].entries,
            [
                GpFifoEntry::new(active.addr(), 4, EntryFlags::NOT_MAIN),
                GpFifoEntry::new(bo.addr().offset(0x100), 0x10, EntryFlags::NOT_MAIN),
                layout.fence_entry(),
            ]
        );
        assert_eq!(q.pending(), [layout.flush_entry(), layout.barrier_entry()]);

        assert_eq!(bo.fence(), kicks[0].fence);
        assert_eq!(active.fence(), kicks[0].fence);
        assert_eq!(bo.access(), BoFlags::RDWR);
        assert_eq!(push.nr_push(), 0);
        assert_eq!(push.nr_buffer(), 1);
        assert_eq!(push.stats().kickoffs, 1);
    }

    #[test]
    fn test_next_batch_starts_with_flush() {
        let r = rig();
        let push = r.pushbuf(true);
        let chan = FifoChannel::new(1);

        push.space(8, 0, 0).unwrap();
        push.emit_slice(&[1, 2, 3, 4]).unwrap();
        push.kick(&chan).unwrap();
        push.emit(5).unwrap();
        push.kick(&chan).unwrap();

        let q = r.queues.queue(0).unwrap();
        let active = push.active_buffer().unwrap();
        let layout = push.cmdlist_layout();
        let kicks = q.kickoffs();
        assert_eq!(
            kicks[1].entries,
            [
                layout.flush_entry(),
                layout.barrier_entry(),
                GpFifoEntry::new(active.addr().offset(16), 1, EntryFlags::NOT_MAIN),
                layout.fence_entry(),
            ]
        );
        assert!(kicks[1].fence.is_after(&kicks[0].fence));
    }

    #[test]
    fn test_rejected_submission_releases_record() {
        let r = rig();
        let push = r.pushbuf(true);
        let q = r.queues.queue(0).unwrap();
        let bo = r.bo();

        q.reject_next(0x2a);
        push.space(8, 0, 0).unwrap();
        push.emit(1).unwrap();
        push.refn(&[PushRef::new(&bo, BoFlags::WR)]).unwrap();

        assert_eq!(push.flush(), Err(Error::SubmissionRejected(0x2a)));
        assert_eq!(push.stats().rejected, 1);
        assert_eq!(q.rejected_count(), 1);
        assert_eq!(q.kickoff_count(), 0);
        assert_eq!(push.nr_buffer(), 0);
        assert_eq!(bo.ref_count(), 1);
        assert!(!bo.fence().is_valid());

        push.space(8, 0, 0).unwrap();
        push.emit(2).unwrap();
        push.flush().unwrap();
        assert_eq!(q.kickoff_count(), 1);
        assert_eq!(q.kickoffs()[0].entries.len(), 2);
    }

    #[test]
    fn test_deferred_flush_seals_records() {
        let r = rig();
        let push = r.pushbuf(false);
        let bo = r.bo();

        push.space(8, 0, 0).unwrap();
        push.emit_slice(&[1, 2]).unwrap();
        push.refn(&[PushRef::new(&bo, BoFlags::WR)]).unwrap();
        push.flush().unwrap();

        assert_eq!(push.records_len(), 2);
        assert_eq!(push.nr_buffer(), 0);
        assert_eq!(r.client.push_get(bo.id()), None);
        assert_eq!(bo.ref_count(), 2);

        push.emit(3).unwrap();
        push.flush().unwrap();
        push.flush().unwrap();
        assert_eq!(push.records_len(), 3);
        assert_eq!(r.queues.queue(0).unwrap().kickoff_count(), 0);
    }

    #[test]
    fn test_deferred_kick_replays_records() {
        let r = rig();
        let push = r.pushbuf(false);
        let chan = FifoChannel::new(3);
        let bo = r.bo();

        push.space(8, 0, 0).unwrap();
        push.emit_slice(&[1, 2]).unwrap();
        push.refn(&[PushRef::new(&bo, BoFlags::WR)]).unwrap();
        push.flush().unwrap();
        push.emit(3).unwrap();
        push.flush().unwrap();

        push.kick(&chan).unwrap();

        let q = r.queues.queue(0).unwrap();
        let active = push.active_buffer().unwrap();
        let layout = push.cmdlist_layout();
        let kicks = q.kickoffs();
        assert_eq!(kicks.len(), 2);
        assert_eq!(
            kicks[0].entries,
            [
                GpFifoEntry::new(active.addr(), 2, EntryFlags::NOT_MAIN),
                layout.fence_entry(),
            ]
        );
        assert_eq!(
            kicks[1].entries,
            [
                layout.flush_entry(),
                layout.barrier_entry(),
                GpFifoEntry::new(active.addr().offset(8), 1, EntryFlags::NOT_MAIN),
                layout.fence_entry(),
            ]
        );
        assert_eq!(bo.fence(), kicks[0].fence);
        assert_eq!(bo.access(), BoFlags::WR);
        assert_eq!(push.records_len(), 3);

        push.kick(&chan).unwrap();
        assert_eq!(q.kickoff_count(), 4);
    }

    #[test]
    fn test_kick_checks_channel_class() {
        let r = rig();
        let push = r.pushbuf(false);

        push.space(8, 0, 0).unwrap();
        push.emit(1).unwrap();
        push.flush().unwrap();

        let copy = FifoChannel::with_class(0xc6b5, 3);
        assert_eq!(push.kick(&copy), Err(Error::InvalidChannelClass));
        assert_eq!(push.records_len(), 2);
        assert_eq!(r.queues.queue(0).unwrap().kickoff_count(), 0);
    }

    #[test]
    fn test_destroy_releases_without_submitting() {
        let r = rig();
        let push = r.pushbuf(false);
        let q = r.queues.queue(0).unwrap();
        let bo = r.bo();

        for word in 0..3 {
            push.space(8, 0, 0).unwrap();
            push.emit(word).unwrap();
            push.refn(&[PushRef::new(&bo, BoFlags::RD)]).unwrap();
            push.flush().unwrap();
        }
        assert_eq!(push.records_len(), 4);
        assert_eq!(bo.ref_count(), 4);

        push.destroy();
        assert_eq!(bo.ref_count(), 1);
        assert_eq!(q.kickoff_count(), 0);
        assert!(q.is_closed());
        assert_eq!(r.client.pushbuf_count(), 0);
        assert_eq!(r.client.tracked_buffers(), 0);
    }

    #[test]
    fn test_kick_notify_writes_before_submit() {
        let r = rig();
        let push = r.pushbuf(true);
        let calls = Rc::new(Cell::new(0u32));

        let seen = calls.clone();
        push.set_kick_reserve(4).unwrap();
        push.set_kick_notify(Some(Box::new(move |s: &mut dyn CommandStream| {
            seen.set(seen.get() + 1);
            s.emit(0xdead).unwrap();
        })))
        .unwrap();

        push.space(8, 0, 0).unwrap();
        assert_eq!(push.cursor(), (0, 1018));
        push.emit(1).unwrap();
        push.kick(&FifoChannel::new(1)).unwrap();

        assert_eq!(calls.get(), 1);
        let active = push.active_buffer().unwrap();
        let kicks = r.queues.queue(0).unwrap().kickoffs();
        assert_eq!(kicks[0].entries[0].num_cmds(), 2);
        assert_eq!(active.read(0, 2).unwrap(), [1, 0xdead]);
    }

    #[test]
    fn test_data_limited_to_one_entry() {
        let r = rig();
        let push = r.pushbuf(true);
        let big = r.mem.bo_new(BoFlags::GART, 0, ByteSize::from_mib(8)).unwrap();
        let max = MAX_ENTRY_WORDS as u64 * 4;

        push.space(8, 0, 0).unwrap();
        push.refn(&[PushRef::new(&big, BoFlags::RD)]).unwrap();
        assert_eq!(push.data(&big, 0, max + 4), Err(Error::BufferOverflow));
        assert_eq!(push.nr_push(), 0);

        push.data(&big, 0, max).unwrap();
        push.kick(&FifoChannel::new(1)).unwrap();

        let kicks = r.queues.queue(0).unwrap().kickoffs();
        assert_eq!(kicks[0].entries[0].num_cmds(), MAX_ENTRY_WORDS);
        assert_eq!(kicks[0].entries[0].addr(), big.addr());
    }

    #[test]
    fn test_kick_hook_cannot_reenter() {
        let r = rig();
        let push = Rc::new(r.pushbuf(true));
        let result = Rc::new(Cell::new(None));

        let weak = Rc::downgrade(&push);
        let seen = result.clone();
        push.set_kick_notify(Some(Box::new(move |_: &mut dyn CommandStream| {
            if let Some(push) = weak.upgrade() {
                seen.set(Some(push.set_kick_reserve(8)));
            }
        })))
        .unwrap();

        push.space(8, 0, 0).unwrap();
        push.emit(1).unwrap();
        push.flush().unwrap();
        assert_eq!(result.get(), Some(Err(Error::Busy)));
        assert_eq!(r.queues.queue(0).unwrap().kickoff_count(), 1);
    }
}
