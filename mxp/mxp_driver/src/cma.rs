// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The `cma` device: maps fresh zeroed DMA buffers into its callers.
//!
//! An mmap at offset 0 allocates a new buffer the size of the mapping. Any
//! other offset is the bus address of a live buffer, which is mapped again
//! without taking ownership of it.

use crate::shared::FileAllocations;
use crate::DriverError;
use dma_region::host::UserMemory;
use dma_region::host::VmArea;
use dma_region::RegionInfo;
use dma_region::RegionManager;
use mxp_defs::ioctl;

/// The allocator device.
#[derive(Clone)]
pub struct CmaDevice {
    regions: RegionManager,
}

impl CmaDevice {
    pub(crate) fn new(regions: RegionManager) -> Self {
        Self { regions }
    }

    /// Opens the device.
    pub fn open(&self) -> CmaFile {
        tracing::info!("cma opened");
        CmaFile {
            regions: self.regions.clone(),
            allocations: FileAllocations::default(),
        }
    }

    /// The region manager backing the device.
    pub fn regions(&self) -> &RegionManager {
        &self.regions
    }
}

/// An open handle to the allocator device.
pub struct CmaFile {
    regions: RegionManager,
    allocations: FileAllocations,
}

impl CmaFile {
    /// Handles an mmap request.
    pub fn mmap(&self, vma: &mut dyn VmArea) -> Result<RegionInfo, DriverError> {
        let offset = vma.offset();
        let result = if offset == 0 {
            self.regions.allocate_and_map(vma)
        } else {
            self.regions.remap_existing(vma, offset)
        };
        result.map_err(DriverError::from).inspect_err(|err| {
            tracing::error!(
                offset,
                len = vma.len(),
                error = err as &dyn std::error::Error,
                "cma mmap failed"
            );
        })
    }

    /// Handles an ioctl with argument `arg` in the caller's memory `user`.
    pub fn ioctl(
        &mut self,
        cmd: u32,
        arg: u64,
        user: &mut dyn UserMemory,
    ) -> Result<(), DriverError> {
        match cmd {
            ioctl::MXP_IOCTL_SHARED_ALLOC => {
                self.allocations.shared_alloc(&self.regions, arg, user)?;
                Ok(())
            }
            _ => Err(DriverError::UnknownIoctl(cmd)),
        }
    }

    /// The number of buffers held by this handle through ioctls.
    pub fn allocations(&self) -> usize {
        self.allocations.len()
    }
}

impl Drop for CmaFile {
    fn drop(&mut self) {
        tracing::info!(allocations = self.allocations.len(), "cma closed");
    }
}
