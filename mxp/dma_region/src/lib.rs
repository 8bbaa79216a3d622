// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared-memory region manager.
//!
//! Turns an mmap or explicit allocation request into a zeroed, bus-contiguous
//! region that both the CPU and the accelerator's DMA engine can reach, maps
//! it into the caller with device cache attributes, and ties the region's
//! lifetime to the mapping so it is freed exactly once when the mapping is
//! torn down.
//!
//! Ownership is structural. A [`SharedRegion`] frees its memory when dropped,
//! and a live mapping holds it through [`MappingAssociation::Owning`]. A
//! mapping created from an existing region's bus address holds
//! [`MappingAssociation::Viewing`], which never frees anything.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod emulated;
pub mod host;

use host::AllocError;
use host::CacheAttr;
use host::CoherentAlloc;
use host::CoherentAllocator;
use host::RemapError;
use host::VmArea;
use host::VmFlags;
use mxp_defs::ErrorClass;
use mxp_defs::PAGE_SIZE;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;
use thiserror::Error;

/// Cache attribute used for every region mapping. The accelerator bypasses
/// the CPU caches.
pub const REGION_CACHE_ATTR: CacheAttr = CacheAttr::DeviceNonCacheable;

/// Error returned by region operations.
#[derive(Debug, Error)]
pub enum RegionError {
    /// The requested length is zero or overflows when page aligned.
    #[error("invalid region length {0:#x}")]
    InvalidLength(usize),
    /// The requested bus address is not page aligned.
    #[error("bus address {0:#x} is not page aligned")]
    Unaligned(u64),
    /// No live region covers the requested bus range.
    #[error("no live region covers {len:#x} bytes at bus address {bus_addr:#x}")]
    UnknownRegion {
        /// Requested bus address.
        bus_addr: u64,
        /// Requested length.
        len: usize,
    },
    /// Backing memory could not be allocated.
    #[error("failed to allocate coherent memory")]
    NoMemory(#[source] AllocError),
    /// The mapping's association record could not be allocated.
    #[error("failed to allocate the mapping association")]
    Association(#[source] AllocError),
    /// The user mapping could not be installed.
    #[error("failed to install the user mapping")]
    Remap(#[source] RemapError),
}

impl RegionError {
    /// The class reported to userspace.
    pub fn class(&self) -> ErrorClass {
        match self {
            RegionError::InvalidLength(_)
            | RegionError::Unaligned(_)
            | RegionError::UnknownRegion { .. } => ErrorClass::InvalidArgument,
            RegionError::NoMemory(_) | RegionError::Association(_) => ErrorClass::NoMemory,
            RegionError::Remap(_) => ErrorClass::TryAgain,
        }
    }
}

/// Describes a region to its creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// CPU address of the region inside the driver.
    pub cpu_addr: u64,
    /// Address the DMA engine uses to reach the region.
    pub bus_addr: u64,
    /// Page-aligned length.
    pub len: usize,
}

/// The coherent memory behind a region. Returned to the allocator when the
/// last holder, owner or view, goes away.
struct RegionMemory {
    alloc: Option<CoherentAlloc>,
    phys: u64,
    allocator: Arc<dyn CoherentAllocator>,
}

impl RegionMemory {
    fn alloc(&self) -> &CoherentAlloc {
        self.alloc.as_ref().expect("only taken on drop")
    }
}

impl std::fmt::Debug for RegionMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionMemory")
            .field("alloc", &self.alloc)
            .field("phys", &format_args!("{:#x}", self.phys))
            .finish()
    }
}

impl Drop for RegionMemory {
    fn drop(&mut self) {
        let alloc = self.alloc.take().expect("dropped once");
        tracing::debug!(
            cpu_addr = alloc.cpu_addr(),
            bus_addr = alloc.bus_addr(),
            len = alloc.len(),
            "freeing region"
        );
        self.allocator.free_coherent(alloc);
    }
}

#[derive(Debug)]
struct IndexEntry {
    id: u64,
    len: usize,
    memory: Weak<RegionMemory>,
}

/// Regions whose owner is still alive, by bus address. Only these can be
/// re-mapped.
#[derive(Debug, Default)]
struct RegionIndex {
    next_id: u64,
    live: BTreeMap<u64, IndexEntry>,
}

impl RegionIndex {
    /// Finds the region fully containing `bus_addr..bus_addr + len`.
    fn containing(&self, bus_addr: u64, len: usize) -> Option<(u64, &IndexEntry)> {
        let (&base, entry) = self.live.range(..=bus_addr).next_back()?;
        let end = bus_addr.checked_add(len as u64)?;
        (end <= base + entry.len as u64).then_some((base, entry))
    }
}

/// A zeroed coherent region.
///
/// Dropping the owner withdraws the region from re-mapping. The memory is
/// returned to the allocator once the owner and every [`RegionView`] of it
/// are gone.
pub struct SharedRegion {
    memory: Arc<RegionMemory>,
    id: u64,
    index: Arc<Mutex<RegionIndex>>,
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("id", &self.id)
            .field("memory", &self.memory)
            .finish()
    }
}

impl SharedRegion {
    /// The region's addresses and length.
    pub fn info(&self) -> RegionInfo {
        let alloc = self.memory.alloc();
        RegionInfo {
            cpu_addr: alloc.cpu_addr(),
            bus_addr: alloc.bus_addr(),
            len: alloc.len(),
        }
    }

    /// The bus address.
    pub fn bus_addr(&self) -> u64 {
        self.memory.alloc().bus_addr()
    }

    /// The page-aligned length.
    pub fn len(&self) -> usize {
        self.memory.alloc().len()
    }

    /// Returns true if the region is empty. Regions are never empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The CPU physical address of the first page.
    pub fn phys_addr(&self) -> u64 {
        self.memory.phys
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        let bus_addr = self.bus_addr();
        {
            let mut index = self.index.lock();
            if let Some(entry) = index.live.remove(&bus_addr) {
                assert_eq!(entry.id, self.id, "region index out of sync");
            }
        }
        let views = Arc::strong_count(&self.memory) - 1;
        if views != 0 {
            tracing::debug!(bus_addr, views, "region owner released, memory kept for views");
        }
    }
}

/// A non-owning mapping of part of a region. Keeps the region's memory
/// allocated until it is dropped.
#[derive(Debug)]
pub struct RegionView {
    memory: Arc<RegionMemory>,
    bus_addr: u64,
    len: usize,
}

impl RegionView {
    /// The first bus address covered by the view.
    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    /// The length of the view.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The bus address of the region being viewed.
    pub fn region_bus_addr(&self) -> u64 {
        self.memory.alloc().bus_addr()
    }
}

/// Private data of a live mapping, released when the mapping is fully torn
/// down.
#[derive(Debug)]
pub enum MappingAssociation {
    /// The mapping owns the region.
    Owning(SharedRegion),
    /// The mapping views a region owned elsewhere.
    Viewing(RegionView),
}

impl MappingAssociation {
    /// Runs the teardown release. The region's memory is freed once its
    /// owner and all its views have been released.
    pub fn release(self) {
        match &self {
            MappingAssociation::Owning(region) => {
                tracing::debug!(bus_addr = region.bus_addr(), "releasing owning mapping");
            }
            MappingAssociation::Viewing(view) => {
                tracing::debug!(bus_addr = view.bus_addr, "releasing viewing mapping");
            }
        }
        drop(self);
    }

    /// Returns true if this association owns its region.
    pub fn is_owning(&self) -> bool {
        matches!(self, MappingAssociation::Owning(_))
    }
}

/// Allocates shared regions and maps them into user address spaces.
#[derive(Clone)]
pub struct RegionManager {
    allocator: Arc<dyn CoherentAllocator>,
    dma_mask: u64,
    index: Arc<Mutex<RegionIndex>>,
}

impl RegionManager {
    /// Creates a manager allocating from `allocator`, with every bus address
    /// inside `dma_mask`.
    pub fn new(allocator: Arc<dyn CoherentAllocator>, dma_mask: u64) -> Self {
        Self {
            allocator,
            dma_mask,
            index: Default::default(),
        }
    }

    /// The DMA mask applied to allocations.
    pub fn dma_mask(&self) -> u64 {
        self.dma_mask
    }

    /// The number of regions whose owner is still alive.
    pub fn live_regions(&self) -> usize {
        self.index.lock().live.len()
    }

    /// Allocates a zeroed region of at least `requested_len` bytes, rounded
    /// up to whole pages.
    pub fn allocate(&self, requested_len: usize) -> Result<SharedRegion, RegionError> {
        let len = mxp_defs::page_align(requested_len)
            .filter(|&len| len != 0)
            .ok_or(RegionError::InvalidLength(requested_len))?;

        let alloc = self
            .allocator
            .alloc_coherent(len, self.dma_mask)
            .map_err(RegionError::NoMemory)?;

        debug_assert_eq!(alloc.len(), len);
        tracing::debug!(
            cpu_addr = alloc.cpu_addr(),
            bus_addr = alloc.bus_addr(),
            len,
            "allocated region"
        );

        let bus_addr = alloc.bus_addr();
        let memory = Arc::new(RegionMemory {
            phys: self.allocator.phys_addr(&alloc),
            alloc: Some(alloc),
            allocator: self.allocator.clone(),
        });
        let id = {
            let mut index = self.index.lock();
            let id = index.next_id;
            index.next_id += 1;
            index.live.insert(
                bus_addr,
                IndexEntry {
                    id,
                    len,
                    memory: Arc::downgrade(&memory),
                },
            );
            id
        };

        Ok(SharedRegion {
            memory,
            id,
            index: self.index.clone(),
        })
    }

    /// Allocates a region the size of `vma` and maps it there.
    ///
    /// On success the mapping owns the region. On failure nothing remains
    /// allocated.
    pub fn allocate_and_map(&self, vma: &mut dyn VmArea) -> Result<RegionInfo, RegionError> {
        vma.set_flags(VmFlags::new().with_dont_expand(true).with_dont_dump(true));

        let region = self.allocate(vma.len())?;
        let slot = vma.alloc_private().map_err(RegionError::Association)?;
        vma.remap_pfn_range(
            mxp_defs::pfn(region.phys_addr()),
            region.len(),
            REGION_CACHE_ATTR,
        )
        .map_err(RegionError::Remap)?;

        let info = region.info();
        vma.set_private(slot, MappingAssociation::Owning(region));
        Ok(info)
    }

    /// Maps part of an existing region, identified by its bus address, into
    /// `vma` without taking ownership of it.
    pub fn remap_existing(
        &self,
        vma: &mut dyn VmArea,
        bus_addr: u64,
    ) -> Result<RegionInfo, RegionError> {
        if bus_addr % PAGE_SIZE as u64 != 0 {
            return Err(RegionError::Unaligned(bus_addr));
        }
        let len = vma.len();
        vma.set_flags(VmFlags::new().with_dont_expand(true).with_dont_dump(true));

        // The view takes its own reference to the memory, so the region stays
        // allocated for as long as this mapping exists.
        let found = self
            .index
            .lock()
            .containing(bus_addr, len)
            .and_then(|(base, entry)| Some((base, entry.memory.upgrade()?)));
        let (base, memory) = found.ok_or(RegionError::UnknownRegion { bus_addr, len })?;

        let slot = vma.alloc_private().map_err(RegionError::Association)?;
        let phys = memory.phys + (bus_addr - base);
        let cpu_addr = memory.alloc().cpu_addr() + (bus_addr - base);
        vma.remap_pfn_range(mxp_defs::pfn(phys), len, REGION_CACHE_ATTR)
            .map_err(RegionError::Remap)?;

        tracing::debug!(bus_addr, len, "mapped view of region");
        vma.set_private(
            slot,
            MappingAssociation::Viewing(RegionView {
                memory,
                bus_addr,
                len,
            }),
        );
        Ok(RegionInfo {
            cpu_addr,
            bus_addr,
            len,
        })
    }
}
