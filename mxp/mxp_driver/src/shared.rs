// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! `MXP_IOCTL_SHARED_ALLOC`: allocate a shared buffer without mapping it.

use crate::DriverError;
use dma_region::host::UserMemory;
use dma_region::RegionManager;
use dma_region::SharedRegion;
use mxp_defs::SharedAlloc;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Buffers allocated through an open file. They live until the file is
/// released.
#[derive(Debug, Default)]
pub struct FileAllocations {
    regions: Vec<SharedRegion>,
}

impl FileAllocations {
    /// Handles the ioctl with its parameter block at user address `arg`.
    pub fn shared_alloc(
        &mut self,
        regions: &RegionManager,
        arg: u64,
        user: &mut dyn UserMemory,
    ) -> Result<SharedAlloc, DriverError> {
        let mut param = SharedAlloc::new_zeroed();
        user.copy_from_user(arg, param.as_mut_bytes())?;

        let len = usize::try_from(param.len).map_err(|_| DriverError::Length(param.len))?;
        let region = regions.allocate(len)?;
        let info = region.info();
        let out = SharedAlloc {
            len: info.len as u64,
            phys: info.bus_addr,
            virt: info.cpu_addr,
        };

        // A failed copy drops the region here, freeing it.
        user.copy_to_user(arg, out.as_bytes())?;

        tracing::debug!(
            len = out.len,
            bus_addr = out.phys,
            cpu_addr = out.virt,
            "shared buffer allocated"
        );
        self.regions.push(region);
        Ok(out)
    }

    /// The number of buffers held.
    pub fn len(&self) -> usize {
        self.regions.len()
    }
}
