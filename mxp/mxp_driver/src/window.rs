// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Maps the accelerator's fixed hardware windows.

use crate::config::MxpConfig;
use crate::config::SizeCheck;
use dma_region::host::CacheAttr;
use dma_region::host::RemapError;
use dma_region::host::VmArea;
use dma_region::host::VmFlags;
use mxp_defs::mmap_offset;
use mxp_defs::ErrorClass;
use mxp_defs::PAGE_SIZE64;
use thiserror::Error;

/// A statically located range of accelerator registers or memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow {
    /// Name used in logs.
    pub name: &'static str,
    /// Bus address of the first byte.
    pub base: u64,
    /// Size in bytes, a page multiple.
    pub size: u64,
}

/// Error mapping a fixed window.
#[derive(Debug, Error)]
pub enum WindowError {
    /// The mmap offset does not select a window.
    #[error("offset {0:#x} does not select a window")]
    UnknownSelector(u64),
    /// The requested length does not fit the window's size check.
    #[error("cannot map {len:#x} bytes of the {window} window ({size:#x} bytes)")]
    BadLength {
        /// The selected window.
        window: &'static str,
        /// The requested length.
        len: u64,
        /// The window size.
        size: u64,
    },
    /// The page tables could not be installed.
    #[error("failed to map the {window} window")]
    Remap {
        /// The selected window.
        window: &'static str,
        /// The underlying failure.
        #[source]
        source: RemapError,
    },
}

impl WindowError {
    /// The class reported to userspace.
    pub fn class(&self) -> ErrorClass {
        match self {
            WindowError::UnknownSelector(_) | WindowError::BadLength { .. } => {
                ErrorClass::InvalidArgument
            }
            WindowError::Remap { .. } => ErrorClass::TryAgain,
        }
    }
}

/// Dispatches mmap requests on the accelerator device to its windows.
#[derive(Debug, Clone)]
pub struct WindowMapper {
    instr_port: FixedWindow,
    scratchpad: FixedWindow,
    size_check: SizeCheck,
}

impl WindowMapper {
    /// Creates the mapper for the windows described by `config`.
    pub fn new(config: &MxpConfig) -> Self {
        Self {
            instr_port: FixedWindow {
                name: "instruction port",
                base: config.instr_port_base,
                size: PAGE_SIZE64,
            },
            scratchpad: FixedWindow {
                name: "scratchpad",
                base: config.scratchpad_base,
                size: config.scratchpad_size,
            },
            size_check: config.size_check,
        }
    }

    /// The instruction port.
    pub fn instr_port(&self) -> &FixedWindow {
        &self.instr_port
    }

    /// The scratchpad.
    pub fn scratchpad(&self) -> &FixedWindow {
        &self.scratchpad
    }

    /// Validates a request of `len` bytes at mmap offset `offset`, returning
    /// the window it maps.
    pub fn select(&self, offset: u64, len: u64) -> Result<&FixedWindow, WindowError> {
        let window = match offset {
            mmap_offset::INSTRUCTION_PORT => &self.instr_port,
            mmap_offset::SCRATCHPAD => &self.scratchpad,
            _ => return Err(WindowError::UnknownSelector(offset)),
        };
        let fits = match self.size_check {
            SizeCheck::Lenient => len <= window.size,
            SizeCheck::Strict => len == window.size,
        };
        if !fits {
            return Err(WindowError::BadLength {
                window: window.name,
                len,
                size: window.size,
            });
        }
        Ok(window)
    }

    /// Maps the window selected by the area's offset. The mapping carries no
    /// release obligation.
    pub fn map(&self, vma: &mut dyn VmArea) -> Result<FixedWindow, WindowError> {
        let window = *self.select(vma.offset(), vma.len() as u64)?;
        tracing::debug!(
            window = window.name,
            base = window.base,
            len = vma.len(),
            "mapping window"
        );

        vma.set_flags(
            VmFlags::new()
                .with_io(true)
                .with_dont_expand(true)
                .with_dont_dump(true),
        );
        vma.remap_pfn_range(
            mxp_defs::pfn(window.base),
            vma.len(),
            CacheAttr::DeviceNonCacheable,
        )
        .map_err(|source| WindowError::Remap {
            window: window.name,
            source,
        })?;
        Ok(window)
    }
}
