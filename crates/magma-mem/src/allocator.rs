//! # Buffer Object Allocation
//!
//! The allocation interface the push buffer uses for its command buffers, and
//! a system-memory implementation backed by host storage.

use core::cell::Cell;

use magma_core::{ByteSize, Error, GpuAddr, Result};

use crate::bo::{BoFlags, BoInfo, BufferId, BufferObject};

// =============================================================================
// ALLOCATOR TRAIT
// =============================================================================

/// Creates and maps buffer objects
pub trait BoAllocator {
    /// Allocate a buffer object
    ///
    /// `align` of zero selects the allocator's natural alignment.
    fn bo_new(&self, flags: BoFlags, align: u64, size: ByteSize) -> Result<BufferObject>;

    /// Map a buffer object for CPU access
    fn bo_map(&self, bo: &BufferObject, access: BoFlags) -> Result<()>;
}

// =============================================================================
// SYSTEM MEMORY ALLOCATOR
// =============================================================================

/// System memory allocator configuration
#[derive(Debug, Clone)]
pub struct SysmemConfig {
    /// First GPU virtual address of the aperture
    pub base: GpuAddr,
    /// Aperture size
    pub aperture: ByteSize,
    /// Minimum alignment and size granularity
    pub page_size: u64,
}

impl SysmemConfig {
    /// A small aperture for unit tests
    pub const fn small() -> Self {
        Self {
            base: GpuAddr::new(0x0010_0000),
            aperture: ByteSize::from_mib(64),
            page_size: 0x1000,
        }
    }
}

impl Default for SysmemConfig {
    fn default() -> Self {
        Self {
            base: GpuAddr::new(0x0001_0000_0000),
            aperture: ByteSize::from_mib(1024),
            page_size: 0x1000,
        }
    }
}

/// Allocator statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct SysmemStats {
    /// Total allocations
    pub allocations: u64,
    /// Total maps
    pub maps: u64,
    /// Bytes of aperture handed out
    pub bytes_allocated: u64,
}

/// Bump allocator over a GART aperture with host-backed storage
///
/// Aperture space is never reused; the allocator is meant for host-side
/// bring-up and tests, where buffer lifetimes are short.
#[derive(Debug)]
pub struct SysmemAllocator {
    config: SysmemConfig,
    /// Next free aperture offset
    next_offset: Cell<u64>,
    /// Next buffer ID
    next_id: Cell<u64>,
    /// Fail the next allocation
    fail_alloc: Cell<bool>,
    /// Fail the next map
    fail_map: Cell<bool>,
    stats: Cell<SysmemStats>,
}

impl SysmemAllocator {
    /// Create a new allocator
    pub fn new(config: SysmemConfig) -> Self {
        Self {
            config,
            next_offset: Cell::new(0),
            next_id: Cell::new(1),
            fail_alloc: Cell::new(false),
            fail_map: Cell::new(false),
            stats: Cell::new(SysmemStats::default()),
        }
    }

    /// Make the next `bo_new` fail with [`Error::AllocationFailed`]
    pub fn fail_next_alloc(&self) {
        self.fail_alloc.set(true);
    }

    /// Make the next `bo_map` fail with [`Error::MappingFailed`]
    pub fn fail_next_map(&self) {
        self.fail_map.set(true);
    }

    /// Get statistics
    pub fn stats(&self) -> SysmemStats {
        self.stats.get()
    }
}

impl BoAllocator for SysmemAllocator {
    fn bo_new(&self, flags: BoFlags, align: u64, size: ByteSize) -> Result<BufferObject> {
        if self.fail_alloc.replace(false) {
            return Err(Error::AllocationFailed);
        }
        if size.as_bytes() == 0 {
            return Err(Error::InvalidParameter);
        }

        let page = self.config.page_size;
        let align = align.max(page);
        if !align.is_power_of_two() {
            return Err(Error::InvalidParameter);
        }

        let base = self.config.base.raw();
        let start = GpuAddr::new(base + self.next_offset.get()).align_up(align);
        let size = size.align_up(page);
        let end = start.raw() + size.as_bytes();
        if end > base + self.config.aperture.as_bytes() {
            log::warn!("GART aperture exhausted allocating {}", size);
            return Err(Error::OutOfMemory);
        }
        self.next_offset.set(end - base);

        let id = BufferId::new(self.next_id.get());
        self.next_id.set(id.id() + 1);

        let mut stats = self.stats.get();
        stats.allocations += 1;
        stats.bytes_allocated += size.as_bytes();
        self.stats.set(stats);

        log::trace!("bo {:?}: {} at {} flags {:?}", id, size, start, flags);

        Ok(BufferObject::from_info(BoInfo {
            id,
            addr: start,
            size,
            flags,
        }))
    }

    fn bo_map(&self, bo: &BufferObject, access: BoFlags) -> Result<()> {
        if self.fail_map.replace(false) {
            return Err(Error::MappingFailed);
        }

        bo.set_mapping(access);

        let mut stats = self.stats.get();
        stats.maps += 1;
        self.stats.set(stats);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_respects_alignment() {
        let mem = SysmemAllocator::new(SysmemConfig::small());
        let a = mem.bo_new(BoFlags::GART, 0, ByteSize::from_bytes(100)).unwrap();
        let b = mem
            .bo_new(BoFlags::GART, 0x2_0000, ByteSize::KIB_4)
            .unwrap();

        assert_eq!(a.size(), ByteSize::KIB_4);
        assert!(b.addr().is_aligned(0x2_0000));
        assert!(b.addr() > a.addr());
        assert_ne!(a.id(), b.id());
        assert_eq!(mem.stats().allocations, 2);
    }

    #[test]
    fn test_aperture_exhaustion() {
        let mem = SysmemAllocator::new(SysmemConfig {
            base: GpuAddr::new(0x1000),
            aperture: ByteSize::from_kib(8),
            page_size: 0x1000,
        });
        mem.bo_new(BoFlags::GART, 0, ByteSize::KIB_4).unwrap();
        mem.bo_new(BoFlags::GART, 0, ByteSize::KIB_4).unwrap();
        assert_eq!(
            mem.bo_new(BoFlags::GART, 0, ByteSize::KIB_4).unwrap_err(),
            Error::OutOfMemory
        );
    }

    #[test]
    fn test_failure_injection_is_one_shot() {
        let mem = SysmemAllocator::new(SysmemConfig::small());
        mem.fail_next_alloc();
        assert_eq!(
            mem.bo_new(BoFlags::GART, 0, ByteSize::KIB_4).unwrap_err(),
            Error::AllocationFailed
        );
        let bo = mem.bo_new(BoFlags::GART, 0, ByteSize::KIB_4).unwrap();

        mem.fail_next_map();
        assert_eq!(mem.bo_map(&bo, BoFlags::WR), Err(Error::MappingFailed));
        mem.bo_map(&bo, BoFlags::WR).unwrap();
        assert!(bo.is_mapped(BoFlags::WR));
    }
}
