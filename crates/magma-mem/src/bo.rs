//! # Buffer Objects
//!
//! GPU-visible allocations handed out by a [`BoAllocator`](crate::BoAllocator).
//!
//! A [`BufferObject`] is a cheap, reference-counted handle. Cloning the handle
//! is how holders pin the allocation: a push buffer record keeps a clone for as
//! long as it references the buffer, and dropping the clone releases it.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::fmt;

use magma_core::{BufferHandle, ByteSize, Error, Fence, GpuAddr, Result};

// =============================================================================
// FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Placement and access flags for buffer objects
    ///
    /// The low bits select where a buffer lives, the `RD`/`WR` bits describe
    /// how a command stream uses it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BoFlags: u32 {
        /// Video memory
        const VRAM = 0x0000_0001;
        /// GART aperture (system memory mapped for the GPU)
        const GART = 0x0000_0002;
        /// Either aperture
        const APER = Self::VRAM.bits() | Self::GART.bits();
        /// Read access
        const RD = 0x0000_0100;
        /// Write access
        const WR = 0x0000_0200;
        /// Read and write access
        const RDWR = Self::RD.bits() | Self::WR.bits();
        /// CPU mappable
        const MAP = 0x8000_0000;
    }
}

bitflags::bitflags! {
    /// Memory domains a command stream access requires
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Domain: u32 {
        /// Video memory
        const VRAM = 1 << 0;
        /// GART aperture
        const GART = 1 << 1;
    }
}

impl Domain {
    /// Resolve the domains requested by placement bits in `flags`
    ///
    /// Accesses that do not name a placement go through the GART aperture.
    pub fn from_placement(flags: BoFlags) -> Self {
        let mut domains = Domain::empty();
        if flags.contains(BoFlags::VRAM) {
            domains |= Domain::VRAM;
        }
        if flags.contains(BoFlags::GART) {
            domains |= Domain::GART;
        }
        if domains.is_empty() {
            Domain::GART
        } else {
            domains
        }
    }
}

// =============================================================================
// BUFFER OBJECT
// =============================================================================

/// Buffer object ID
pub type BufferId = BufferHandle;

/// Allocation-time description of a buffer object
#[derive(Debug, Clone, Copy)]
pub struct BoInfo {
    /// Unique ID
    pub id: BufferId,
    /// GPU virtual address
    pub addr: GpuAddr,
    /// Size
    pub size: ByteSize,
    /// Placement flags
    pub flags: BoFlags,
}

struct BoInner {
    info: BoInfo,
    /// Host backing storage, one entry per 32-bit word
    storage: RefCell<Vec<u32>>,
    /// Access the current CPU mapping allows
    mapping: Cell<Option<BoFlags>>,
    /// Fence of the last submission that referenced this buffer
    fence: Cell<Fence>,
    /// Accesses observed by the GPU since the last wait
    access: Cell<BoFlags>,
}

/// Reference-counted handle to a buffer object
#[derive(Clone)]
pub struct BufferObject {
    inner: Rc<BoInner>,
}

impl BufferObject {
    /// Wrap a fresh allocation
    ///
    /// Called by allocators; the storage is zero-filled.
    pub fn from_info(info: BoInfo) -> Self {
        let words = info.size.as_dwords() as usize;
        let mut storage = Vec::new();
        storage.resize(words, 0);

        Self {
            inner: Rc::new(BoInner {
                info,
                storage: RefCell::new(storage),
                mapping: Cell::new(None),
                fence: Cell::new(Fence::NONE),
                access: Cell::new(BoFlags::empty()),
            }),
        }
    }

    /// Get buffer ID
    pub fn id(&self) -> BufferId {
        self.inner.info.id
    }

    /// Get GPU address
    pub fn addr(&self) -> GpuAddr {
        self.inner.info.addr
    }

    /// Get size
    pub fn size(&self) -> ByteSize {
        self.inner.info.size
    }

    /// Size in 32-bit words
    pub fn size_dwords(&self) -> u32 {
        self.inner.info.size.as_dwords() as u32
    }

    /// Get placement flags
    pub fn flags(&self) -> BoFlags {
        self.inner.info.flags
    }

    /// Number of live handles (the owner plus every holder)
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    /// Check if both handles name the same allocation
    pub fn ptr_eq(&self, other: &BufferObject) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // =========================================================================
    // CPU mapping
    // =========================================================================

    /// Record a CPU mapping with the given access
    pub fn set_mapping(&self, access: BoFlags) {
        let prev = self.inner.mapping.get().unwrap_or(BoFlags::empty());
        self.inner.mapping.set(Some(prev | (access & BoFlags::RDWR)));
    }

    /// Check if mapped with at least `access`
    pub fn is_mapped(&self, access: BoFlags) -> bool {
        self.inner
            .mapping
            .get()
            .is_some_and(|mapped| mapped.contains(access & BoFlags::RDWR))
    }

    /// Write words at a word offset through the CPU mapping
    pub fn write(&self, dword_offset: u32, words: &[u32]) -> Result<()> {
        if !self.is_mapped(BoFlags::WR) {
            return Err(Error::MappingFailed);
        }

        let mut storage = self.inner.storage.borrow_mut();
        let start = dword_offset as usize;
        let end = start.checked_add(words.len()).ok_or(Error::BufferOverflow)?;
        let dst = storage.get_mut(start..end).ok_or(Error::BufferOverflow)?;
        dst.copy_from_slice(words);
        Ok(())
    }

    /// Read words at a word offset
    ///
    /// Reads go through the host backing directly so diagnostics can inspect
    /// buffers that are only mapped for writing.
    pub fn read(&self, dword_offset: u32, count: u32) -> Result<Vec<u32>> {
        let storage = self.inner.storage.borrow();
        let start = dword_offset as usize;
        let end = start
            .checked_add(count as usize)
            .ok_or(Error::BufferOverflow)?;
        storage
            .get(start..end)
            .map(<[u32]>::to_vec)
            .ok_or(Error::BufferOverflow)
    }

    // =========================================================================
    // GPU tracking
    // =========================================================================

    /// Fence of the last submission that referenced the buffer
    pub fn fence(&self) -> Fence {
        self.inner.fence.get()
    }

    /// Store a new submission fence
    pub fn set_fence(&self, fence: Fence) {
        self.inner.fence.set(fence);
    }

    /// Accesses the GPU may still be performing
    pub fn access(&self) -> BoFlags {
        self.inner.access.get()
    }

    /// Accumulate observed accesses
    pub fn add_access(&self, access: BoFlags) {
        let prev = self.inner.access.get();
        self.inner.access.set(prev | (access & BoFlags::RDWR));
    }

    /// Forget observed accesses once the fence has been waited on
    pub fn clear_access(&self) {
        self.inner.access.set(BoFlags::empty());
    }
}

impl PartialEq for BufferObject {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for BufferObject {}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("id", &self.inner.info.id)
            .field("addr", &self.inner.info.addr)
            .field("size", &self.inner.info.size)
            .field("flags", &self.inner.info.flags)
            .field("fence", &self.inner.fence.get())
            .finish()
    }
}
