//! # Pending Records
//!
//! A record (krec) is one flush unit: the buffers a batch references and the
//! command ranges it submits. Records queue up in a [`RecordQueue`]; an
//! immediate push buffer only ever uses the first one, a deferred push buffer
//! seals records and keeps them for replay.
//!
//! ```text
//!  RecordQueue
//! ┌──────────┬──────────┬──────────┐
//! │ krec 0   │ krec 1   │ krec 2   │◀── current
//! │ sealed   │ sealed   │ filling  │
//! └──────────┴──────────┴──────────┘
//!    buffers: [Kref; ≤ MAX_BUFFERS]
//!    pushes:  [KrecPush; ≤ MAX_PUSH] ── bo_index ──▶ buffers
//! ```

use alloc::boxed::Box;
use alloc::vec::Vec;

use arrayvec::ArrayVec;
use magma_core::{ByteSize, Error, Result};
use magma_mem::{BoFlags, BufferId, BufferObject, Domain};

// =============================================================================
// LIMITS
// =============================================================================

/// Buffer references one record can hold
pub const MAX_BUFFERS: usize = 1024;

/// Command ranges one record can hold
pub const MAX_PUSH: usize = 512;

/// Per-record memory budget for placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DomainLimits {
    /// Video memory bytes a record may reference; `None` is unlimited
    pub vram: Option<ByteSize>,
    /// GART bytes a record may reference; `None` is unlimited
    pub gart: Option<ByteSize>,
}

impl DomainLimits {
    /// No limits
    pub const UNLIMITED: Self = Self {
        vram: None,
        gart: None,
    };
}

// =============================================================================
// BUFFER REFERENCE
// =============================================================================

/// A buffer referenced by a record
#[derive(Debug, Clone)]
pub struct Kref {
    /// The referenced buffer; holding it pins the allocation
    pub bo: BufferObject,
    /// Buffer handle
    pub handle: BufferId,
    /// Domain the buffer was placed in
    pub domain: Domain,
    /// Domains read by the batch
    pub read_domains: Domain,
    /// Domains written by the batch
    pub write_domains: Domain,
}

impl Kref {
    fn new(bo: BufferObject, domain: Domain, flags: BoFlags) -> Self {
        let mut kref = Self {
            handle: bo.id(),
            bo,
            domain,
            read_domains: Domain::empty(),
            write_domains: Domain::empty(),
        };
        kref.accumulate(flags);
        kref
    }

    /// OR the access in `flags` into the read/write domains
    pub fn accumulate(&mut self, flags: BoFlags) {
        if flags.contains(BoFlags::RD) {
            self.read_domains |= self.domain;
        }
        if flags.contains(BoFlags::WR) {
            self.write_domains |= self.domain;
        }
    }

    /// Access flags the batch uses the buffer with
    pub fn access(&self) -> BoFlags {
        let mut flags = BoFlags::empty();
        if !self.read_domains.is_empty() {
            flags |= BoFlags::RD;
        }
        if !self.write_domains.is_empty() {
            flags |= BoFlags::WR;
        }
        flags
    }
}

/// A command range submitted by a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KrecPush {
    /// Index of the buffer in the record's buffer list
    pub bo_index: u32,
    /// Byte offset into the buffer
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
}

// =============================================================================
// RECORD
// =============================================================================

/// One flush unit
#[derive(Debug, Default)]
pub struct Krec {
    buffers: ArrayVec<Kref, MAX_BUFFERS>,
    pushes: ArrayVec<KrecPush, MAX_PUSH>,
    vram_used: u64,
    gart_used: u64,
}

impl Krec {
    /// Create an empty record
    pub fn new() -> Box<Self> {
        Box::default()
    }

    /// Number of referenced buffers
    pub fn nr_buffer(&self) -> usize {
        self.buffers.len()
    }

    /// Number of command ranges
    pub fn nr_push(&self) -> usize {
        self.pushes.len()
    }

    /// Check if the record holds neither buffers nor ranges
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.pushes.is_empty()
    }

    /// Referenced buffers in insertion order
    pub fn buffers(&self) -> &[Kref] {
        &self.buffers
    }

    /// Command ranges in submission order
    pub fn pushes(&self) -> &[KrecPush] {
        &self.pushes
    }

    /// Get a reference by index
    pub fn kref(&self, index: u32) -> Option<&Kref> {
        self.buffers.get(index as usize)
    }

    /// Get a mutable reference by index
    pub fn kref_mut(&mut self, index: u32) -> Option<&mut Kref> {
        self.buffers.get_mut(index as usize)
    }

    /// Bytes referenced in video memory
    pub fn vram_used(&self) -> ByteSize {
        ByteSize::from_bytes(self.vram_used)
    }

    /// Bytes referenced through the GART
    pub fn gart_used(&self) -> ByteSize {
        ByteSize::from_bytes(self.gart_used)
    }

    /// Pick a placement for `bo` out of `requested` within `limits`
    ///
    /// Video memory wins when requested and it still fits.
    pub fn fits(&self, bo: &BufferObject, requested: Domain, limits: &DomainLimits) -> Option<Domain> {
        let size = bo.size().as_bytes();
        let within = |used: u64, limit: Option<ByteSize>| {
            limit.is_none_or(|limit| used + size <= limit.as_bytes())
        };

        if requested.contains(Domain::VRAM) && within(self.vram_used, limits.vram) {
            Some(Domain::VRAM)
        } else if requested.contains(Domain::GART) && within(self.gart_used, limits.gart) {
            Some(Domain::GART)
        } else {
            None
        }
    }

    /// Append a reference to `bo`, returning its index
    ///
    /// Fails with [`Error::NoSpace`] when the record is full or the buffer
    /// does not fit in any requested domain.
    pub fn add_kref(
        &mut self,
        bo: &BufferObject,
        flags: BoFlags,
        limits: &DomainLimits,
    ) -> Result<u32> {
        if self.buffers.is_full() {
            return Err(Error::NoSpace);
        }
        let domain = self
            .fits(bo, Domain::from_placement(flags), limits)
            .ok_or(Error::NoSpace)?;

        self.charge(domain, bo.size().as_bytes() as i64);
        let index = self.buffers.len() as u32;
        self.buffers.push(Kref::new(bo.clone(), domain, flags));
        self.check();
        Ok(index)
    }

    /// Append a command range
    pub fn add_push(&mut self, push: KrecPush) -> Result<()> {
        if (push.bo_index as usize) >= self.buffers.len() {
            return Err(Error::InvalidParameter);
        }
        self.pushes.try_push(push).map_err(|_| Error::NoSpace)?;
        self.check();
        Ok(())
    }

    /// Drop every reference at or after `nr_buffer`, handing them back
    pub fn truncate_buffers(&mut self, nr_buffer: usize) -> Vec<Kref> {
        let released: Vec<Kref> = self.buffers.drain(nr_buffer.min(self.buffers.len())..).collect();
        for kref in &released {
            self.charge(kref.domain, -(kref.bo.size().as_bytes() as i64));
        }
        self.check();
        released
    }

    /// Empty the record for reuse, handing back its references
    pub fn reset(&mut self) -> Vec<Kref> {
        self.pushes.clear();
        self.truncate_buffers(0)
    }

    fn charge(&mut self, domain: Domain, bytes: i64) {
        let used = if domain == Domain::VRAM {
            &mut self.vram_used
        } else {
            &mut self.gart_used
        };
        *used = used.wrapping_add_signed(bytes);
    }

    #[cfg(feature = "validation")]
    fn check(&self) {
        assert!(self.buffers.len() <= MAX_BUFFERS);
        assert!(self.pushes.len() <= MAX_PUSH);
        for push in &self.pushes {
            assert!((push.bo_index as usize) < self.buffers.len());
            let kref = &self.buffers[push.bo_index as usize];
            assert!(push.offset + push.length <= kref.bo.size().as_bytes());
        }
        for (i, a) in self.buffers.iter().enumerate() {
            assert!(self.buffers[i + 1..].iter().all(|b| !b.bo.ptr_eq(&a.bo)));
        }
    }

    #[cfg(not(feature = "validation"))]
    #[inline(always)]
    fn check(&self) {}
}

// =============================================================================
// ROLLBACK
// =============================================================================

/// Undo point for a batch of reference insertions
///
/// New references are truncated on rollback; references that existed at the
/// undo point get back the access they had then.
#[derive(Debug, Clone)]
#[must_use]
pub struct KrefTxn {
    saved: usize,
    /// (index, read domains, write domains) of touched older references
    touched: Vec<(u32, Domain, Domain)>,
}

impl KrefTxn {
    /// Remember the record's current buffer count
    pub fn begin(krec: &Krec) -> Self {
        Self {
            saved: krec.nr_buffer(),
            touched: Vec::new(),
        }
    }

    /// Snapshot reference `index` before the batch changes its access
    pub fn touch(&mut self, krec: &Krec, index: u32) {
        if index as usize >= self.saved || self.touched.iter().any(|t| t.0 == index) {
            return;
        }
        if let Some(kref) = krec.kref(index) {
            self.touched
                .push((index, kref.read_domains, kref.write_domains));
        }
    }

    /// Release every reference added since [`KrefTxn::begin`]
    pub fn rollback(self, krec: &mut Krec) -> Vec<Kref> {
        for (index, read, write) in self.touched {
            if let Some(kref) = krec.kref_mut(index) {
                kref.read_domains = read;
                kref.write_domains = write;
            }
        }
        krec.truncate_buffers(self.saved)
    }
}

// =============================================================================
// RECORD QUEUE
// =============================================================================

/// Ordered records with one current record
#[derive(Debug)]
pub struct RecordQueue {
    records: Vec<Box<Krec>>,
    current: usize,
}

impl RecordQueue {
    /// Create a queue holding one empty record
    pub fn new() -> Self {
        let mut records = Vec::new();
        records.push(Krec::new());
        Self {
            records,
            current: 0,
        }
    }

    /// Number of records, sealed ones included
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Always false: the queue keeps a current record
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record being filled
    pub fn current(&self) -> &Krec {
        &self.records[self.current]
    }

    /// Record being filled, mutably
    pub fn current_mut(&mut self) -> &mut Krec {
        &mut self.records[self.current]
    }

    /// Records to submit, in order, up to the first one without ranges
    pub fn submittable(&self) -> impl Iterator<Item = &Krec> {
        self.records
            .iter()
            .map(|krec| &**krec)
            .take_while(|krec| krec.nr_push() > 0)
    }

    /// Keep the current record and start filling a fresh one
    pub fn seal(&mut self) {
        self.records.push(Krec::new());
        self.current = self.records.len() - 1;
    }

    /// Take every record out, leaving one empty current record
    pub fn drain(&mut self) -> Vec<Box<Krec>> {
        self.current = 0;
        core::mem::replace(&mut self.records, alloc::vec![Krec::new()])
    }
}

impl Default for RecordQueue {
    fn default() -> Self {
        Self::new()
    }
}
