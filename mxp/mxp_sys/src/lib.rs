// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Userspace access to the `/dev/cma` and `/dev/mxp0` device nodes.

#![cfg(unix)]
// UNSAFETY: Manual memory management with mmap and mxp ioctls.
#![expect(unsafe_code)]

use anyhow::Context;
use libc::c_void;
use mxp_defs::mmap_offset;
use mxp_defs::names;
use mxp_defs::SharedAlloc;
use std::fs::File;
use std::os::unix::prelude::*;
use std::path::Path;

mod ioctl {
    use mxp_defs::ioctl::MXP_IOCTL_SHARED_ALLOC;
    use mxp_defs::ioctl::MXP_IOCTL_SP_BASE;
    use mxp_defs::ioctl::MXP_IOCTL_SP_SIZE;
    use mxp_defs::SharedAlloc;

    nix::ioctl_read_bad!(mxp_sp_base, MXP_IOCTL_SP_BASE, u64);
    nix::ioctl_read_bad!(mxp_sp_size, MXP_IOCTL_SP_SIZE, u64);
    nix::ioctl_readwrite_bad!(mxp_shared_alloc, MXP_IOCTL_SHARED_ALLOC, SharedAlloc);
}

fn open_node(path: &Path) -> anyhow::Result<File> {
    let file = fs_err::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)?;
    Ok(file.into())
}

fn map(file: &File, offset: u64, len: usize) -> anyhow::Result<MappedRegion> {
    // SAFETY: The file descriptor is valid and no address is being passed.
    // The result is being validated.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            offset as i64,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("failed to map {len:#x} bytes at offset {offset:#x}"));
    }
    tracing::debug!(offset, len, "mapped device region");
    Ok(MappedRegion { addr, len })
}

fn shared_alloc(file: &File, len: u64) -> anyhow::Result<SharedAlloc> {
    let mut param = SharedAlloc {
        len,
        ..Default::default()
    };
    // SAFETY: The file descriptor is valid and a correctly constructed struct is being passed.
    unsafe {
        ioctl::mxp_shared_alloc(file.as_raw_fd(), &mut param)
            .context("failed to allocate shared buffer")?;
    }
    Ok(param)
}

/// An open `/dev/cma`.
pub struct CmaDevice {
    file: File,
}

impl CmaDevice {
    /// Opens the default device node.
    pub fn new() -> anyhow::Result<Self> {
        Self::open(Path::new("/dev").join(names::CMA_NODE).as_ref())
    }

    /// Opens the device node at `path`.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            file: open_node(path)?,
        })
    }

    /// Allocates and maps a zeroed, physically contiguous buffer of at least
    /// `len` bytes. The buffer is freed when the last mapping of it goes away.
    pub fn alloc(&self, len: usize) -> anyhow::Result<MappedRegion> {
        map(&self.file, 0, len).context("cma allocation failed")
    }

    /// Maps the live buffer at bus address `bus_addr` again.
    pub fn remap(&self, bus_addr: u64, len: usize) -> anyhow::Result<MappedRegion> {
        anyhow::ensure!(bus_addr != 0, "bus address 0 requests a new buffer");
        map(&self.file, bus_addr, len)
    }

    /// Allocates a buffer owned by this handle without mapping it.
    pub fn shared_alloc(&self, len: u64) -> anyhow::Result<SharedAlloc> {
        shared_alloc(&self.file, len)
    }
}

/// An open `/dev/mxp0`.
pub struct MxpDevice {
    file: File,
}

impl MxpDevice {
    /// Opens the default device node.
    pub fn new() -> anyhow::Result<Self> {
        Self::open(Path::new("/dev").join(names::MXP_NODE).as_ref())
    }

    /// Opens the device node at `path`.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            file: open_node(path)?,
        })
    }

    /// Maps the instruction port.
    pub fn map_instruction_port(&self) -> anyhow::Result<MappedRegion> {
        map(
            &self.file,
            mmap_offset::INSTRUCTION_PORT,
            mxp_defs::PAGE_SIZE,
        )
    }

    /// Maps the first `len` bytes of the scratchpad.
    pub fn map_scratchpad(&self, len: usize) -> anyhow::Result<MappedRegion> {
        map(&self.file, mmap_offset::SCRATCHPAD, len)
    }

    /// The scratchpad's physical base address.
    pub fn scratchpad_base(&self) -> anyhow::Result<u64> {
        let mut base = 0;
        // SAFETY: The file descriptor is valid and the output is a u64.
        unsafe {
            ioctl::mxp_sp_base(self.file.as_raw_fd(), &mut base)
                .context("failed to query scratchpad base")?;
        }
        Ok(base)
    }

    /// The scratchpad's size in bytes.
    pub fn scratchpad_size(&self) -> anyhow::Result<u64> {
        let mut size = 0;
        // SAFETY: The file descriptor is valid and the output is a u64.
        unsafe {
            ioctl::mxp_sp_size(self.file.as_raw_fd(), &mut size)
                .context("failed to query scratchpad size")?;
        }
        Ok(size)
    }

    /// Allocates a buffer owned by this handle without mapping it.
    pub fn shared_alloc(&self, len: u64) -> anyhow::Result<SharedAlloc> {
        shared_alloc(&self.file, len)
    }
}

/// A mapping of device memory, unmapped on drop.
pub struct MappedRegion {
    addr: *mut c_void,
    len: usize,
}

// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Send for MappedRegion {}
// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// The mapped address.
    pub fn as_ptr(&self) -> *mut c_void {
        self.addr
    }

    /// The requested mapping length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the 32-bit word at `offset`.
    pub fn read_u32(&self, offset: usize) -> u32 {
        assert_eq!(offset % 4, 0);
        assert!(offset.saturating_add(4) <= self.len);
        // SAFETY: We have validated that the offset is inside the region.
        unsafe { std::ptr::read_volatile(self.addr.byte_add(offset).cast()) }
    }

    /// Writes the 32-bit word at `offset`.
    pub fn write_u32(&self, offset: usize, data: u32) {
        assert_eq!(offset % 4, 0);
        assert!(offset.saturating_add(4) <= self.len);
        // SAFETY: We have validated that the offset is inside the region.
        unsafe {
            std::ptr::write_volatile(self.addr.byte_add(offset).cast(), data);
        }
    }

    /// Reads the 64-bit word at `offset`.
    pub fn read_u64(&self, offset: usize) -> u64 {
        assert_eq!(offset % 8, 0);
        assert!(offset.saturating_add(8) <= self.len);
        // SAFETY: We have validated that the offset is inside the region.
        unsafe { std::ptr::read_volatile(self.addr.byte_add(offset).cast()) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: The address and length are a valid mmap result.
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}
