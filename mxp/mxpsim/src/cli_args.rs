// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! CLI argument parsing.
//!
//! This module only turns raw CLI strings into typed values. Building the
//! emulated board and loading the drivers happens in main.

#![warn(missing_docs)]

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use std::path::PathBuf;

/// Runs the MXP drivers against an emulated board.
#[derive(Parser, Debug)]
pub struct Options {
    /// device-tree node to read `vblx,*` properties from, such as
    /// /proc/device-tree/amba/mxp@b0000000. Hardware defaults are used if
    /// omitted.
    #[clap(long, value_name = "PATH")]
    pub dt_node: Option<PathBuf>,

    /// reject mmap lengths that differ from the window size
    #[clap(long)]
    pub strict: bool,

    /// contiguous memory pool size
    #[clap(long, value_name = "SIZE", default_value = "16M", value_parser = parse_memory)]
    pub pool_size: u64,

    /// physical base of the contiguous memory pool
    #[clap(long, value_name = "ADDR", default_value = "0x10000000", value_parser = parse_number)]
    pub pool_base: u64,

    /// bus address minus physical address for pool memory
    #[clap(long, value_name = "OFFSET", default_value = "0", value_parser = parse_number)]
    pub bus_offset: u64,

    #[clap(subcommand)]
    pub command: Command,
}

/// What to do once the drivers are loaded.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// list the attributes published on mxp0
    Attrs,
    /// map fresh buffers through /dev/cma
    CmaAlloc {
        /// buffer size
        #[clap(long, value_name = "SIZE", default_value = "4K", value_parser = parse_memory)]
        len: u64,
        /// number of buffers
        #[clap(long, default_value = "1")]
        count: usize,
    },
    /// map the instruction port and scratchpad through /dev/mxp0
    Windows,
    /// allocate an unmapped buffer with MXP_IOCTL_SHARED_ALLOC
    SharedAlloc {
        /// buffer size
        #[clap(long, value_name = "SIZE", default_value = "4K", value_parser = parse_memory)]
        len: u64,
    },
}

fn parse_memory(s: &str) -> anyhow::Result<u64> {
    || -> Option<u64> {
        let mut b = s.as_bytes();
        if s.ends_with('B') {
            b = &b[..b.len() - 1]
        }
        if b.is_empty() {
            return None;
        }
        let multi = match b[b.len() - 1] as char {
            'G' => Some(1024 * 1024 * 1024),
            'M' => Some(1024 * 1024),
            'K' => Some(1024),
            _ => None,
        };
        if multi.is_some() {
            b = &b[..b.len() - 1]
        }
        let n: u64 = std::str::from_utf8(b).ok()?.parse().ok()?;
        n.checked_mul(multi.unwrap_or(1))
    }()
    .with_context(|| format!("invalid memory size '{0}'", s))
}

/// Parse a number from a string that could be prefixed with 0x to indicate hex.
fn parse_number(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(rest) => u64::from_str_radix(rest, 16),
        None => s.parse::<u64>(),
    }
}
