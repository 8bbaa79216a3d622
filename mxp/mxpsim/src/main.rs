// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Loads the MXP drivers on an emulated board and exercises them the way a
//! userspace client would.

mod cli_args;
mod tracing_init;

use anyhow::Context;
use clap::Parser;
use cli_args::Command;
use cli_args::Options;
use dma_region::emulated::EmulatedProcess;
use dma_region::host::UserMemory;
use mxp_defs::ioctl;
use mxp_defs::mmap_offset;
use mxp_defs::SharedAlloc;
use mxp_driver::attrs::AttributeTable;
use mxp_driver::config::MxpConfig;
use mxp_driver::config::SizeCheck;
use mxp_driver::dt;
use mxp_driver::emulated::BoardLayout;
use mxp_driver::emulated::EmulatedPlatform;
use mxp_driver::DriverState;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

fn main() -> anyhow::Result<()> {
    tracing_init::enable_tracing()?;
    let opts = Options::parse();
    run(opts)
}

fn run(opts: Options) -> anyhow::Result<()> {
    let attrs = match &opts.dt_node {
        Some(path) => dt::load_attributes(&dt::ProcDeviceTreeNode::new(path))?,
        None => AttributeTable::hardware_defaults(),
    };
    let config = MxpConfig {
        size_check: if opts.strict {
            SizeCheck::Strict
        } else {
            SizeCheck::Lenient
        },
        ..Default::default()
    }
    .with_attributes(&attrs)
    .context("device tree describes an unusable board")?;

    let layout = BoardLayout {
        pool_base: opts.pool_base,
        pool_size: opts.pool_size,
        bus_offset: opts.bus_offset,
    };
    let platform = EmulatedPlatform::new(&config, &layout)?;
    let state = DriverState::load(&platform.services(), attrs, config)
        .context("failed to load drivers")?;

    let result = match opts.command {
        Command::Attrs => show_attrs(&platform),
        Command::CmaAlloc { len, count } => cma_alloc(&state, &platform, len, count),
        Command::Windows => windows(&state, &platform),
        Command::SharedAlloc { len } => shared_alloc(&state, &platform, len),
    };

    state.unload();
    platform.pool.validate()?;
    result
}

fn show_attrs(platform: &EmulatedPlatform) -> anyhow::Result<()> {
    for (name, value) in platform.host.attributes(mxp_defs::names::MXP_NODE) {
        println!("{name} = {value}");
    }
    Ok(())
}

fn cma_alloc(
    state: &DriverState,
    platform: &EmulatedPlatform,
    len: u64,
    count: usize,
) -> anyhow::Result<()> {
    anyhow::ensure!(len != 0, "buffer length must be nonzero");
    let len = usize::try_from(len).context("buffer length too large")?;
    let file = state.cma().open();
    let mut process = EmulatedProcess::new(platform.phys.clone());
    for i in 0..count {
        let mut info = None;
        let va = process.mmap(len, 0, |vma| {
            info = Some(file.mmap(vma)?);
            anyhow::Ok(())
        })?;
        let info = info.context("mmap returned no region")?;
        println!(
            "buffer {i}: va {va:#x} bus {:#x} len {:#x}",
            info.bus_addr, info.len
        );
    }
    for alloc in platform.pool.allocations() {
        println!(
            "pool: pfn {:#x} pages {} owner {}",
            alloc.base_pfn, alloc.size_pages, alloc.tag
        );
    }
    Ok(())
}

fn windows(state: &DriverState, platform: &EmulatedPlatform) -> anyhow::Result<()> {
    let mut file = state.mxp().open();
    let mut process = EmulatedProcess::new(platform.phys.clone());

    let instr = process.mmap(mxp_defs::PAGE_SIZE, mmap_offset::INSTRUCTION_PORT, |vma| {
        file.mmap(vma)
    })?;
    println!("instruction port: {:#x}", process.read_u32(instr)?);

    let arg = process.alloc_user_buffer(size_of::<u64>());
    file.ioctl(ioctl::MXP_IOCTL_SP_BASE, arg, &mut process)?;
    let base = process.read_u64(arg)?;
    file.ioctl(ioctl::MXP_IOCTL_SP_SIZE, arg, &mut process)?;
    let size = process.read_u64(arg)?;
    println!("scratchpad: base {base:#x} size {size:#x}");

    let size = usize::try_from(size).context("scratchpad too large")?;
    let sp = process.mmap(size, mmap_offset::SCRATCHPAD, |vma| file.mmap(vma))?;
    process.write(sp, 0x1234_5678u32.as_bytes())?;
    println!("scratchpad word 0: {:#x}", process.read_u32(sp)?);

    let mut buf = [0; 16];
    println!("read: {} bytes", file.read(&mut buf));
    Ok(())
}

fn shared_alloc(state: &DriverState, platform: &EmulatedPlatform, len: u64) -> anyhow::Result<()> {
    let mut file = state.mxp().open();
    let mut process = EmulatedProcess::new(platform.phys.clone());
    let arg = process.alloc_user_buffer(size_of::<SharedAlloc>());
    process.copy_to_user(
        arg,
        SharedAlloc {
            len,
            ..Default::default()
        }
        .as_bytes(),
    )?;
    file.ioctl(ioctl::MXP_IOCTL_SHARED_ALLOC, arg, &mut process)?;

    let mut out = [0; size_of::<SharedAlloc>()];
    process.copy_from_user(arg, &mut out)?;
    let out = SharedAlloc::read_from_bytes(&out)
        .map_err(|_| anyhow::anyhow!("short parameter block"))?;
    println!(
        "shared buffer: len {:#x} bus {:#x} kernel va {:#x}",
        out.len, out.phys, out.virt
    );
    Ok(())
}
