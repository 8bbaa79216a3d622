// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The `mxp0` device: the accelerator's control interface.

use crate::shared::FileAllocations;
use crate::window::FixedWindow;
use crate::window::WindowMapper;
use crate::DriverError;
use dma_region::host::UserMemory;
use dma_region::host::VmArea;
use dma_region::RegionManager;
use mxp_defs::ioctl;
use zerocopy::IntoBytes;

/// The accelerator device.
#[derive(Clone)]
pub struct MxpDevice {
    windows: WindowMapper,
    regions: RegionManager,
}

impl MxpDevice {
    pub(crate) fn new(windows: WindowMapper, regions: RegionManager) -> Self {
        Self { windows, regions }
    }

    /// Opens the device.
    pub fn open(&self) -> MxpFile {
        tracing::info!("device opened");
        MxpFile {
            windows: self.windows.clone(),
            regions: self.regions.clone(),
            allocations: FileAllocations::default(),
        }
    }

    /// The window mapper.
    pub fn windows(&self) -> &WindowMapper {
        &self.windows
    }

    /// The region manager behind shared allocations.
    pub fn regions(&self) -> &RegionManager {
        &self.regions
    }
}

/// An open handle to the accelerator device.
pub struct MxpFile {
    windows: WindowMapper,
    regions: RegionManager,
    allocations: FileAllocations,
}

impl MxpFile {
    /// Maps the instruction port (offset 0) or the scratchpad (offset
    /// `PAGE_SIZE`).
    pub fn mmap(&self, vma: &mut dyn VmArea) -> Result<FixedWindow, DriverError> {
        self.windows
            .map(vma)
            .map_err(DriverError::from)
            .inspect_err(|err| {
                tracing::error!(
                    offset = vma.offset(),
                    len = vma.len(),
                    error = err as &dyn std::error::Error,
                    "mxp mmap failed"
                );
            })
    }

    /// Reads from the device. There is nothing to read.
    pub fn read(&self, _buf: &mut [u8]) -> usize {
        0
    }

    /// Handles an ioctl with argument `arg` in the caller's memory `user`.
    pub fn ioctl(
        &mut self,
        cmd: u32,
        arg: u64,
        user: &mut dyn UserMemory,
    ) -> Result<(), DriverError> {
        tracing::debug!(cmd, arg, "ioctl");
        let result = match cmd {
            ioctl::MXP_IOCTL_SP_BASE => user
                .copy_to_user(arg, self.windows.scratchpad().base.as_bytes())
                .map_err(DriverError::from),
            ioctl::MXP_IOCTL_SP_SIZE => user
                .copy_to_user(arg, self.windows.scratchpad().size.as_bytes())
                .map_err(DriverError::from),
            ioctl::MXP_IOCTL_SHARED_ALLOC => self
                .allocations
                .shared_alloc(&self.regions, arg, user)
                .map(drop),
            _ => Err(DriverError::UnknownIoctl(cmd)),
        };
        result.inspect_err(|err| {
            tracing::error!(cmd, error = err as &dyn std::error::Error, "ioctl failed");
        })
    }

    /// The number of buffers held by this handle through ioctls.
    pub fn allocations(&self) -> usize {
        self.allocations.len()
    }
}

impl Drop for MxpFile {
    fn drop(&mut self) {
        tracing::info!(allocations = self.allocations.len(), "device closed");
    }
}
