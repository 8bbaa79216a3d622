// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces the region manager consumes from its host environment.
//!
//! The host owns page tables, the coherent DMA allocator, and the process
//! address space. This crate only describes what it needs from them.

use crate::MappingAssociation;
use bitfield_struct::bitfield;
use thiserror::Error;

/// Cache and protection attribute of an installed mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAttr {
    /// Ordinary cached memory.
    Normal,
    /// Memory kept coherent with the device by the platform.
    DeviceCoherent,
    /// Uncached device memory.
    DeviceNonCacheable,
}

/// Flags on a virtual memory area.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct VmFlags {
    /// The area maps device I/O memory.
    pub io: bool,
    /// The area may not be grown with mremap.
    pub dont_expand: bool,
    /// The area is excluded from core dumps.
    pub dont_dump: bool,

    #[bits(29)]
    _reserved: u32,
}

/// Identity of one coherent allocation: CPU address, bus address, length.
///
/// There is exactly one value per live allocation and it is consumed when
/// the allocation is freed, so the triple handed back to the allocator is
/// always the one it produced.
#[derive(Debug, PartialEq, Eq)]
pub struct CoherentAlloc {
    cpu_addr: u64,
    bus_addr: u64,
    len: usize,
}

impl CoherentAlloc {
    /// Creates the identity for a fresh allocation. Called by
    /// [`CoherentAllocator`] implementations only.
    pub fn new(cpu_addr: u64, bus_addr: u64, len: usize) -> Self {
        Self {
            cpu_addr,
            bus_addr,
            len,
        }
    }

    /// The CPU-side address of the allocation.
    pub fn cpu_addr(&self) -> u64 {
        self.cpu_addr
    }

    /// The address the DMA engine uses for the allocation.
    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    /// The allocation length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the allocation is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Error returned when the host is out of memory.
#[derive(Debug, Error)]
#[error("unable to allocate {len:#x} bytes")]
pub struct AllocError {
    /// The requested size.
    pub len: usize,
}

/// Page-granular memory shared between the CPU and a DMA engine.
pub trait CoherentAllocator: Send + Sync {
    /// Allocates `len` bytes of zeroed memory whose bus addresses all fall
    /// within `mask`. `len` is a non-zero page multiple.
    fn alloc_coherent(&self, len: usize, mask: u64) -> Result<CoherentAlloc, AllocError>;

    /// Frees an allocation previously returned by
    /// [`Self::alloc_coherent`].
    fn free_coherent(&self, alloc: CoherentAlloc);

    /// Returns the CPU physical address backing `alloc`, used to build page
    /// table entries. May differ from the bus address.
    fn phys_addr(&self, alloc: &CoherentAlloc) -> u64;
}

/// Error returned when a page range cannot be installed.
#[derive(Debug, Error)]
#[error("failed to map pfn {pfn:#x} ({len:#x} bytes) at {addr:#x}")]
pub struct RemapError {
    /// Virtual address the range was to be installed at.
    pub addr: u64,
    /// Target page frame.
    pub pfn: u64,
    /// Length of the range.
    pub len: usize,
}

/// Storage for a mapping's private data, reserved before any resource is
/// attached to the mapping.
#[derive(Debug)]
pub struct PrivateSlot(());

impl PrivateSlot {
    /// Creates a slot. Called by [`VmArea`] implementations once the record
    /// memory has been obtained.
    pub fn new() -> Self {
        Self(())
    }
}

impl Default for PrivateSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// A virtual memory area being set up by an mmap request.
///
/// The area is only inserted into the process if the driver's mmap handler
/// returns success. Once inserted, the host drops (or explicitly releases)
/// the attached [`MappingAssociation`] exactly once, when the last page of
/// the area has been unmapped or the process exits.
pub trait VmArea {
    /// First virtual address of the area.
    fn start(&self) -> u64;

    /// Length of the area in bytes, always a page multiple.
    fn len(&self) -> usize;

    /// Offset of the request in pages.
    fn pgoff(&self) -> u64;

    /// Byte offset of the request.
    fn offset(&self) -> u64 {
        self.pgoff() << mxp_defs::PAGE_SHIFT
    }

    /// Adds `flags` to the area's flags.
    fn set_flags(&mut self, flags: VmFlags);

    /// Reserves memory for the area's private data.
    fn alloc_private(&mut self) -> Result<PrivateSlot, AllocError>;

    /// Installs page table entries for `len` bytes starting at the first
    /// page of the area, pointing at consecutive frames from `pfn`.
    fn remap_pfn_range(&mut self, pfn: u64, len: usize, attr: CacheAttr) -> Result<(), RemapError>;

    /// Attaches the association released at teardown.
    fn set_private(&mut self, slot: PrivateSlot, assoc: MappingAssociation);
}

/// Error returned when user memory cannot be accessed.
#[derive(Debug, Error)]
#[error("bad user address {addr:#x}")]
pub struct UserAccessError {
    /// The faulting address.
    pub addr: u64,
}

/// Access to the calling process's memory across the trust boundary.
pub trait UserMemory {
    /// Reads `data.len()` bytes at user address `addr`.
    fn copy_from_user(&self, addr: u64, data: &mut [u8]) -> Result<(), UserAccessError>;

    /// Writes `data` at user address `addr`.
    fn copy_to_user(&mut self, addr: u64, data: &[u8]) -> Result<(), UserAccessError>;
}
