// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Platform configuration of an MXP instance.

use crate::attrs::AttributeTable;
use mxp_defs::xpar;
use mxp_defs::PAGE_SIZE64;
use thiserror::Error;

/// How fixed-window mmap lengths are checked against the window size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SizeCheck {
    /// The mapping may cover any leading part of the window.
    #[default]
    Lenient,
    /// The mapping must cover exactly the whole window.
    Strict,
}

/// Error in the platform configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A window base is not page aligned.
    #[error("{name} {value:#x} is not page aligned")]
    Unaligned {
        /// The attribute or parameter name.
        name: &'static str,
        /// The offending value.
        value: u64,
    },
    /// The scratchpad size is zero, not a page multiple, or overflows.
    #[error("invalid scratchpad size {0} KiB")]
    ScratchpadSize(u64),
    /// The window lies above the device's bus mask.
    #[error("{name} window {base:#x}+{size:#x} is outside the {bits}-bit bus")]
    OutsideBus {
        /// The window name.
        name: &'static str,
        /// Window base.
        base: u64,
        /// Window size.
        size: u64,
        /// Mask width.
        bits: u32,
    },
}

/// Describes the hardware a driver instance manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxpConfig {
    /// Bus address of the scratchpad.
    pub scratchpad_base: u64,
    /// Scratchpad size in bytes.
    pub scratchpad_size: u64,
    /// Bus address of the instruction port.
    pub instr_port_base: u64,
    /// Width of the DMA mask applied to both devices.
    pub dma_mask_bits: u32,
    /// Window length policy.
    pub size_check: SizeCheck,
}

impl Default for MxpConfig {
    fn default() -> Self {
        Self {
            scratchpad_base: xpar::S_AXI_BASEADDR,
            scratchpad_size: xpar::SCRATCHPAD_KB as u64 * 1024,
            instr_port_base: xpar::S_AXI_INSTR_BASEADDR,
            dma_mask_bits: 32,
            size_check: SizeCheck::default(),
        }
    }
}

impl MxpConfig {
    /// Applies the window parameters present in `attrs` and validates the
    /// result.
    pub fn with_attributes(mut self, attrs: &AttributeTable) -> Result<Self, ConfigError> {
        if let Some(base) = attrs.get("S_AXI_BASEADDR") {
            self.scratchpad_base = base;
        }
        if let Some(kb) = attrs.get("SCRATCHPAD_KB") {
            self.scratchpad_size = kb
                .checked_mul(1024)
                .ok_or(ConfigError::ScratchpadSize(kb))?;
        }
        if let Some(base) = attrs.get("S_AXI_INSTR_BASEADDR") {
            self.instr_port_base = base;
        }
        self.validate()?;
        Ok(self)
    }

    /// Checks alignment and bus reachability of both windows.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scratchpad_size == 0 || self.scratchpad_size % PAGE_SIZE64 != 0 {
            return Err(ConfigError::ScratchpadSize(self.scratchpad_size / 1024));
        }
        for (name, value) in [
            ("S_AXI_BASEADDR", self.scratchpad_base),
            ("S_AXI_INSTR_BASEADDR", self.instr_port_base),
        ] {
            if value % PAGE_SIZE64 != 0 {
                return Err(ConfigError::Unaligned { name, value });
            }
        }
        let mask = mxp_defs::dma_bit_mask(self.dma_mask_bits);
        for (name, base, size) in [
            ("scratchpad", self.scratchpad_base, self.scratchpad_size),
            ("instruction port", self.instr_port_base, PAGE_SIZE64),
        ] {
            let fits = base
                .checked_add(size - 1)
                .is_some_and(|last| last & !mask == 0);
            if !fits {
                return Err(ConfigError::OutsideBus {
                    name,
                    base,
                    size,
                    bits: self.dma_mask_bits,
                });
            }
        }
        Ok(())
    }

    /// The DMA mask.
    pub fn dma_mask(&self) -> u64 {
        mxp_defs::dma_bit_mask(self.dma_mask_bits)
    }
}
