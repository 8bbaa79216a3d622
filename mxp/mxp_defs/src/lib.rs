// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Userspace ABI definitions for the VectorBlox MXP and CMA character devices.
//!
//! Everything in this crate is shared between the driver core and userspace
//! clients: page geometry, mmap offset selectors, ioctl command numbers, the
//! wire layout of the shared allocation request, and the error classes that
//! surface to callers as errno values.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The page size used for all mappings and allocations.
pub const PAGE_SIZE: usize = 4096;
/// `PAGE_SIZE` as a `u64`.
pub const PAGE_SIZE64: u64 = PAGE_SIZE as u64;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Rounds `len` up to a whole number of pages, returning `None` on overflow.
pub const fn page_align(len: usize) -> Option<usize> {
    match len.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// Returns the page frame number containing `addr`.
pub const fn pfn(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

/// Device node names and registration names.
pub mod names {
    /// Registration name of the allocator device.
    pub const CMA_DRIVER: &str = "CMA";
    /// Device node name of the allocator device.
    pub const CMA_NODE: &str = "cma";
    /// Registration name of the accelerator device.
    pub const MXP_DRIVER: &str = "MXP";
    /// Device node name of the accelerator device.
    pub const MXP_NODE: &str = "mxp0";
}

/// mmap offset selectors understood by the accelerator device.
pub mod mmap_offset {
    use super::PAGE_SIZE64;

    /// Maps the instruction port.
    pub const INSTRUCTION_PORT: u64 = 0;
    /// Maps the scratchpad.
    pub const SCRATCHPAD: u64 = PAGE_SIZE64;
}

/// ioctl command numbers. These are plain numbers, not `_IOC` encoded.
pub mod ioctl {
    /// Returns the scratchpad bus address as a `u64`.
    pub const MXP_IOCTL_SP_BASE: u32 = 1;
    /// Returns the scratchpad size in bytes as a `u64`.
    pub const MXP_IOCTL_SP_SIZE: u32 = 2;
    /// Allocates a shared DMA buffer, in/out [`SharedAlloc`](super::SharedAlloc).
    pub const MXP_IOCTL_SHARED_ALLOC: u32 = 3;
}

/// In/out parameter block for [`ioctl::MXP_IOCTL_SHARED_ALLOC`].
///
/// All fields are fixed-width so the layout does not depend on the
/// userspace word size.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct SharedAlloc {
    /// In: requested length. Out: the page-aligned length actually allocated.
    pub len: u64,
    /// Out: bus address the accelerator uses to reach the buffer.
    pub phys: u64,
    /// Out: CPU address of the buffer inside the driver.
    pub virt: u64,
}

/// The error classes reported to userspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Backing memory could not be allocated.
    NoMemory,
    /// A user-supplied buffer could not be read or written.
    Access,
    /// Bad offset, size, or command.
    InvalidArgument,
    /// The mapping could not be installed; any allocation was undone.
    TryAgain,
}

impl ErrorClass {
    /// The positive errno value for this class.
    pub const fn errno(self) -> i32 {
        match self {
            ErrorClass::NoMemory => libc::ENOMEM,
            ErrorClass::Access => libc::EACCES,
            ErrorClass::InvalidArgument => libc::EINVAL,
            ErrorClass::TryAgain => libc::EAGAIN,
        }
    }
}

/// Synthesis parameters of the reference MXP instance.
///
/// These are the defaults used when the platform configuration does not
/// override them.
pub mod xpar {
    /// Number of MXP instances.
    pub const NUM_INSTANCES: u32 = 1;
    /// Device id of instance 0.
    pub const DEVICE_ID: u32 = 0;
    /// Scratchpad bus base address.
    pub const S_AXI_BASEADDR: u64 = 0xB000_0000;
    /// Last scratchpad bus address (inclusive).
    pub const S_AXI_HIGHADDR: u64 = 0xB000_FFFF;
    /// Vector lane count.
    pub const VECTOR_LANES: u32 = 2;
    /// Maximum number of masked waves.
    pub const MAX_MASKED_WAVES: u32 = 128;
    /// Mask partitions.
    pub const MASK_PARTITIONS: u32 = 1;
    /// Scratchpad size in KiB.
    pub const SCRATCHPAD_KB: u32 = 64;
    /// DMA master data width in bits.
    pub const M_AXI_DATA_WIDTH: u32 = 64;
    /// Fixed-point multiply fraction bits for words.
    pub const MULFXP_WORD_FRACTION_BITS: u32 = 16;
    /// Fixed-point multiply fraction bits for halfwords.
    pub const MULFXP_HALF_FRACTION_BITS: u32 = 15;
    /// Fixed-point multiply fraction bits for bytes.
    pub const MULFXP_BYTE_FRACTION_BITS: u32 = 4;
    /// Instruction port bus address.
    pub const S_AXI_INSTR_BASEADDR: u64 = 0x4000_0000;
    /// Whether the custom vector instruction interface is enabled.
    pub const ENABLE_VCI: u32 = 0;
    /// Custom vector instruction lanes.
    pub const VCI_LANES: u32 = 1;
    /// Core clock in Hz.
    pub const CLOCK_FREQ_HZ: u32 = 100_000_000;

    /// Every parameter above as `(attribute name, value)`, in header order.
    pub const ALL: &[(&str, u64)] = &[
        ("NUM_INSTANCES", NUM_INSTANCES as u64),
        ("DEVICE_ID", DEVICE_ID as u64),
        ("S_AXI_BASEADDR", S_AXI_BASEADDR),
        ("S_AXI_HIGHADDR", S_AXI_HIGHADDR),
        ("VECTOR_LANES", VECTOR_LANES as u64),
        ("MAX_MASKED_WAVES", MAX_MASKED_WAVES as u64),
        ("MASK_PARTITIONS", MASK_PARTITIONS as u64),
        ("SCRATCHPAD_KB", SCRATCHPAD_KB as u64),
        ("M_AXI_DATA_WIDTH", M_AXI_DATA_WIDTH as u64),
        ("MULFXP_WORD_FRACTION_BITS", MULFXP_WORD_FRACTION_BITS as u64),
        ("MULFXP_HALF_FRACTION_BITS", MULFXP_HALF_FRACTION_BITS as u64),
        ("MULFXP_BYTE_FRACTION_BITS", MULFXP_BYTE_FRACTION_BITS as u64),
        ("S_AXI_INSTR_BASEADDR", S_AXI_INSTR_BASEADDR),
        ("ENABLE_VCI", ENABLE_VCI as u64),
        ("VCI_LANES", VCI_LANES as u64),
        ("CLOCK_FREQ_HZ", CLOCK_FREQ_HZ as u64),
    ];
}

/// The bus address mask every device in this family is configured with.
pub const DMA_BIT_MASK_32: u64 = (1 << 32) - 1;

/// Returns a DMA mask covering `bits` address bits.
pub const fn dma_bit_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1 << bits) - 1
    }
}
