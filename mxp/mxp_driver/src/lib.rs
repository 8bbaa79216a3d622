// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Driver core for the VectorBlox MXP accelerator and its companion
//! contiguous-memory device.
//!
//! [`DriverState::load`] registers the `cma` and `mxp0` device nodes, sets
//! their DMA masks, and publishes the accelerator's device-tree attributes.
//! Everything it acquires is released in reverse order by
//! [`DriverState::unload`], or as soon as a later load step fails.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod attrs;
pub mod cma;
pub mod config;
pub mod dt;
pub mod emulated;
pub mod mxp;
pub mod registry;
mod shared;
pub mod window;

use attrs::AttributeTable;
use cma::CmaDevice;
use config::ConfigError;
use config::MxpConfig;
use dma_region::host::CoherentAllocator;
use dma_region::host::UserAccessError;
use dma_region::RegionError;
use dma_region::RegionManager;
use mxp::MxpDevice;
use mxp_defs::names;
use mxp_defs::ErrorClass;
use registry::AttributePublisher;
use registry::CharDeviceHost;
use registry::PublishedAttributes;
use registry::RegisterError;
use registry::Registration;
use std::sync::Arc;
use thiserror::Error;
use window::WindowError;
use window::WindowMapper;

/// Error returned by a device file operation.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Allocating or mapping a shared region failed.
    #[error("shared region request failed")]
    Region(#[from] RegionError),
    /// Mapping a fixed window failed.
    #[error("window mapping failed")]
    Window(#[from] WindowError),
    /// The caller's parameter block could not be accessed.
    #[error("bad user buffer")]
    UserAccess(#[from] UserAccessError),
    /// The requested length does not fit the address space.
    #[error("length {0:#x} too large")]
    Length(u64),
    /// The ioctl command is not supported by the device.
    #[error("unknown ioctl {0:#x}")]
    UnknownIoctl(u32),
}

impl DriverError {
    /// The class reported to userspace.
    pub fn class(&self) -> ErrorClass {
        match self {
            DriverError::Region(err) => err.class(),
            DriverError::Window(err) => err.class(),
            DriverError::UserAccess(_) => ErrorClass::Access,
            DriverError::Length(_) | DriverError::UnknownIoctl(_) => ErrorClass::InvalidArgument,
        }
    }

    /// The positive errno value reported to userspace.
    pub fn errno(&self) -> i32 {
        self.class().errno()
    }
}

/// Error loading the drivers.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The platform configuration is unusable.
    #[error("invalid platform configuration")]
    Config(#[source] ConfigError),
    /// A host registration step failed.
    #[error("device registration failed")]
    Register(#[source] RegisterError),
}

impl LoadError {
    /// The positive errno value the module load fails with.
    pub fn errno(&self) -> i32 {
        match self {
            LoadError::Config(_) => ErrorClass::InvalidArgument.errno(),
            LoadError::Register(err) => err.source.errno,
        }
    }
}

/// The host services the drivers are loaded with.
#[derive(Clone)]
pub struct HostServices {
    /// Character device registration.
    pub chardev: Arc<dyn CharDeviceHost>,
    /// Attribute publication.
    pub publisher: Arc<dyn AttributePublisher>,
    /// Coherent memory for the `cma` device.
    pub cma_allocator: Arc<dyn CoherentAllocator>,
    /// Coherent memory for the `mxp0` device.
    pub mxp_allocator: Arc<dyn CoherentAllocator>,
}

/// The loaded drivers.
pub struct DriverState {
    config: MxpConfig,
    attrs: AttributeTable,
    cma: CmaDevice,
    mxp: MxpDevice,
    // Dropped in declaration order, the reverse of acquisition.
    _mxp_attrs: PublishedAttributes,
    _mxp_node: Registration,
    _cma_node: Registration,
}

impl DriverState {
    /// Loads both drivers. `attrs` holds the accelerator's device-tree
    /// properties, which override the matching fields of `config`.
    pub fn load(
        host: &HostServices,
        attrs: AttributeTable,
        config: MxpConfig,
    ) -> Result<Self, LoadError> {
        let config = config.with_attributes(&attrs).map_err(LoadError::Config)?;
        let mask = config.dma_mask();

        let cma_node = Registration::register(
            host.chardev.clone(),
            names::CMA_DRIVER,
            names::CMA_NODE,
            mask,
        )
        .map_err(LoadError::Register)?;
        let mxp_node = Registration::register(
            host.chardev.clone(),
            names::MXP_DRIVER,
            names::MXP_NODE,
            mask,
        )
        .map_err(LoadError::Register)?;
        let mxp_attrs = PublishedAttributes::publish(
            host.publisher.clone(),
            names::MXP_DRIVER,
            mxp_node.device(),
            &attrs,
        )
        .map_err(LoadError::Register)?;

        let cma = CmaDevice::new(RegionManager::new(host.cma_allocator.clone(), mask));
        let mxp = MxpDevice::new(
            WindowMapper::new(&config),
            RegionManager::new(host.mxp_allocator.clone(), mask),
        );

        tracing::info!(
            scratchpad_base = config.scratchpad_base,
            scratchpad_size = config.scratchpad_size,
            instr_port_base = config.instr_port_base,
            attributes = mxp_attrs.len(),
            "MXP driver loaded"
        );

        Ok(Self {
            config,
            attrs,
            cma,
            mxp,
            _mxp_attrs: mxp_attrs,
            _mxp_node: mxp_node,
            _cma_node: cma_node,
        })
    }

    /// Unloads the drivers, unregistering both device nodes.
    ///
    /// Buffers still held by open files or live mappings stay valid until
    /// those are released.
    pub fn unload(self) {
        tracing::info!("cleaning up module");
        drop(self);
    }

    /// The effective configuration.
    pub fn config(&self) -> &MxpConfig {
        &self.config
    }

    /// The accelerator's attribute table.
    pub fn attributes(&self) -> &AttributeTable {
        &self.attrs
    }

    /// The allocator device.
    pub fn cma(&self) -> &CmaDevice {
        &self.cma
    }

    /// The accelerator device.
    pub fn mxp(&self) -> &MxpDevice {
        &self.mxp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SizeCheck;
    use crate::emulated::BoardLayout;
    use crate::emulated::EmulatedPlatform;
    use crate::emulated::HostFault;
    use crate::emulated::INSTR_PORT_ID;
    use dma_region::emulated::EmulatedProcess;
    use dma_region::host::UserMemory;
    use mxp_defs::ioctl;
    use mxp_defs::mmap_offset;
    use mxp_defs::SharedAlloc;
    use mxp_defs::PAGE_SIZE;
    use test_with_tracing::test;
    use zerocopy::FromBytes;
    use zerocopy::IntoBytes;

    fn platform() -> EmulatedPlatform {
        EmulatedPlatform::new(&MxpConfig::default(), &BoardLayout::default()).unwrap()
    }

    fn load(platform: &EmulatedPlatform, config: MxpConfig) -> DriverState {
        DriverState::load(
            &platform.services(),
            AttributeTable::from_properties([("vblx,vector_lanes", 2)]).unwrap(),
            config,
        )
        .unwrap()
    }

    fn shared_alloc(
        file: &mut mxp::MxpFile,
        process: &mut EmulatedProcess,
        len: u64,
    ) -> Result<SharedAlloc, DriverError> {
        let arg = process.alloc_user_buffer(size_of::<SharedAlloc>());
        process
            .copy_to_user(
                arg,
                SharedAlloc {
                    len,
                    ..Default::default()
                }
                .as_bytes(),
            )
            .unwrap();
        file.ioctl(ioctl::MXP_IOCTL_SHARED_ALLOC, arg, process)?;
        let mut out = [0; size_of::<SharedAlloc>()];
        process.copy_from_user(arg, &mut out).unwrap();
        Ok(SharedAlloc::read_from_bytes(&out).unwrap())
    }

    #[test]
    fn load_and_unload() {
        let platform = platform();
        let state = load(&platform, MxpConfig::default());
        assert!(platform.host.has_node("cma"));
        assert!(platform.host.has_node("mxp0"));
        assert_eq!(
            platform.host.coherent_mask("mxp0"),
            Some(mxp_defs::DMA_BIT_MASK_32)
        );
        assert_eq!(
            platform.host.read_attribute("mxp0", "VECTOR_LANES").as_deref(),
            Some("0x2")
        );
        state.unload();
        assert!(platform.host.is_clean());
    }

    #[test]
    fn load_failures_clean_up() {
        for fault in [
            HostFault::DeviceNumber,
            HostFault::Cdev,
            HostFault::Class,
            HostFault::Device,
            HostFault::DmaMask,
            HostFault::AttributeAfter(0),
        ] {
            let platform = platform();
            platform.host.inject(fault);
            let err = DriverState::load(
                &platform.services(),
                AttributeTable::hardware_defaults(),
                MxpConfig::default(),
            )
            .err()
            .unwrap();
            assert!(matches!(err, LoadError::Register(_)));
            assert!(platform.host.is_clean(), "{fault:?} left state behind");
        }
    }

    #[test]
    fn bad_config_registers_nothing() {
        let platform = platform();
        let err = DriverState::load(
            &platform.services(),
            AttributeTable::from_properties([("vblx,scratchpad_kb", 3)]).unwrap(),
            MxpConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, LoadError::Config(_)));
        assert!(platform.host.is_clean());
    }

    #[test]
    fn cma_mmap_lifecycle() {
        let platform = platform();
        let state = load(&platform, MxpConfig::default());
        let file = state.cma().open();
        let mut process = EmulatedProcess::new(platform.phys.clone());

        let mut info = None;
        let va = process
            .mmap(5000, 0, |vma| {
                info = Some(file.mmap(vma)?);
                Ok::<_, DriverError>(())
            })
            .unwrap();
        let info = info.unwrap();
        assert_eq!(info.len, 2 * PAGE_SIZE);
        // The first word is zero: the bus address comes back in `info`.
        assert_eq!(process.read_u64(va).unwrap(), 0);
        assert_eq!(platform.pool.outstanding(), 1);

        // Map the same buffer again by bus address.
        let view = process
            .mmap(PAGE_SIZE, info.bus_addr, |vma| file.mmap(vma))
            .unwrap();
        process.write(va, &[0xab; 8]).unwrap();
        assert_eq!(process.read_u64(view).unwrap(), u64::from_ne_bytes([0xab; 8]));

        process.munmap(view, PAGE_SIZE).unwrap();
        assert_eq!(platform.pool.outstanding(), 1);
        process.munmap(va, 2 * PAGE_SIZE).unwrap();
        platform.pool.validate().unwrap();
    }

    #[test]
    fn cma_view_outlives_owner() {
        let platform = platform();
        let state = load(&platform, MxpConfig::default());
        let file = state.cma().open();
        let mut owner = EmulatedProcess::new(platform.phys.clone());
        let mut viewer = EmulatedProcess::new(platform.phys.clone());

        let mut info = None;
        let owner_va = owner
            .mmap(PAGE_SIZE, 0, |vma| {
                info = Some(file.mmap(vma)?);
                Ok::<_, DriverError>(())
            })
            .unwrap();
        let bus = info.unwrap().bus_addr;
        let view_va = viewer.mmap(PAGE_SIZE, bus, |vma| file.mmap(vma)).unwrap();

        owner.munmap(owner_va, PAGE_SIZE).unwrap();
        assert_eq!(platform.pool.outstanding(), 1);

        let mut other = EmulatedProcess::new(platform.phys.clone());
        let mut other_info = None;
        let other_va = other
            .mmap(PAGE_SIZE, 0, |vma| {
                other_info = Some(file.mmap(vma)?);
                Ok::<_, DriverError>(())
            })
            .unwrap();
        assert_ne!(other_info.unwrap().bus_addr, bus);
        other.write(other_va, &0x5ec2e7u32.to_ne_bytes()).unwrap();
        assert_eq!(viewer.read_u32(view_va).unwrap(), 0);

        viewer.munmap(view_va, PAGE_SIZE).unwrap();
        assert_eq!(platform.pool.outstanding(), 1);
        drop(other);
        platform.pool.validate().unwrap();
    }

    #[test]
    fn cma_view_keeps_ioctl_buffer() {
        let platform = platform();
        let state = load(&platform, MxpConfig::default());
        let mut owner = state.cma().open();
        let mut process = EmulatedProcess::new(platform.phys.clone());

        let arg = process.alloc_user_buffer(size_of::<SharedAlloc>());
        let request = SharedAlloc {
            len: 1,
            ..Default::default()
        };
        process.copy_to_user(arg, request.as_bytes()).unwrap();
        owner
            .ioctl(ioctl::MXP_IOCTL_SHARED_ALLOC, arg, &mut process)
            .unwrap();
        let mut out = [0; size_of::<SharedAlloc>()];
        process.copy_from_user(arg, &mut out).unwrap();
        let out = SharedAlloc::read_from_bytes(&out).unwrap();

        let viewer = state.cma().open();
        let view_va = process
            .mmap(PAGE_SIZE, out.phys, |vma| viewer.mmap(vma))
            .unwrap();
        drop(owner);
        assert_eq!(platform.pool.outstanding(), 1);

        process.munmap(view_va, PAGE_SIZE).unwrap();
        platform.pool.validate().unwrap();
    }

    #[test]
    fn cma_errors() {
        let platform = platform();
        let state = load(&platform, MxpConfig::default());
        let mut file = state.cma().open();
        let mut process = EmulatedProcess::new(platform.phys.clone());

        platform.pool.fail_next_alloc();
        let err = process
            .mmap(PAGE_SIZE, 0, |vma| file.mmap(vma))
            .unwrap_err();
        assert_eq!(err.errno(), libc_errno::ENOMEM);

        process.fail_next_remap();
        let err = process
            .mmap(PAGE_SIZE, 0, |vma| file.mmap(vma))
            .unwrap_err();
        assert_eq!(err.errno(), libc_errno::EAGAIN);
        platform.pool.validate().unwrap();

        let err = process
            .mmap(PAGE_SIZE, 0x8000_0000, |vma| file.mmap(vma))
            .unwrap_err();
        assert_eq!(err.errno(), libc_errno::EINVAL);

        let err = file
            .ioctl(ioctl::MXP_IOCTL_SP_BASE, 0, &mut process)
            .unwrap_err();
        assert_eq!(err.errno(), libc_errno::EINVAL);
    }

    #[test]
    fn process_exit_releases_mappings() {
        let platform = platform();
        let state = load(&platform, MxpConfig::default());
        let file = state.cma().open();
        let mut process = EmulatedProcess::new(platform.phys.clone());
        for len in [PAGE_SIZE, 3 * PAGE_SIZE, 1] {
            process.mmap(len, 0, |vma| file.mmap(vma)).unwrap();
        }
        assert_eq!(platform.pool.outstanding(), 3);
        drop(process);
        platform.pool.validate().unwrap();
    }

    #[test]
    fn mxp_windows() {
        let platform = platform();
        let state = load(
            &platform,
            MxpConfig {
                size_check: SizeCheck::Strict,
                ..Default::default()
            },
        );
        let file = state.mxp().open();
        let mut process = EmulatedProcess::new(platform.phys.clone());

        let instr = process
            .mmap(PAGE_SIZE, mmap_offset::INSTRUCTION_PORT, |vma| file.mmap(vma))
            .unwrap();
        assert_eq!(process.read_u32(instr).unwrap(), INSTR_PORT_ID);
        let err = process
            .mmap(2 * PAGE_SIZE, mmap_offset::INSTRUCTION_PORT, |vma| {
                file.mmap(vma)
            })
            .unwrap_err();
        assert_eq!(err.errno(), libc_errno::EINVAL);

        let sp_size = state.config().scratchpad_size as usize;
        process
            .mmap(sp_size, mmap_offset::SCRATCHPAD, |vma| file.mmap(vma))
            .unwrap();
        process
            .mmap(sp_size + 1, mmap_offset::SCRATCHPAD, |vma| file.mmap(vma))
            .unwrap_err();

        let mut buf = [0; 16];
        assert_eq!(file.read(&mut buf), 0);
    }

    #[test]
    fn mxp_scratchpad_ioctls() {
        let platform = platform();
        let state = load(&platform, MxpConfig::default());
        let mut file = state.mxp().open();
        let mut process = EmulatedProcess::new(platform.phys.clone());
        let arg = process.alloc_user_buffer(8);

        file.ioctl(ioctl::MXP_IOCTL_SP_BASE, arg, &mut process)
            .unwrap();
        assert_eq!(process.read_u64(arg).unwrap(), 0xb000_0000);
        file.ioctl(ioctl::MXP_IOCTL_SP_SIZE, arg, &mut process)
            .unwrap();
        assert_eq!(process.read_u64(arg).unwrap(), 0x10000);

        let err = file
            .ioctl(ioctl::MXP_IOCTL_SP_BASE, 0x10, &mut process)
            .unwrap_err();
        assert_eq!(err.errno(), libc_errno::EACCES);
        let err = file.ioctl(42, arg, &mut process).unwrap_err();
        assert_eq!(err.errno(), libc_errno::EINVAL);
    }

    #[test]
    fn shared_alloc_owned_by_file() {
        let platform = platform();
        let state = load(&platform, MxpConfig::default());
        let mut file = state.mxp().open();
        let mut process = EmulatedProcess::new(platform.phys.clone());

        let out = shared_alloc(&mut file, &mut process, 100).unwrap();
        assert_eq!(out.len, PAGE_SIZE as u64);
        assert!(out.phys <= mxp_defs::DMA_BIT_MASK_32);
        assert_ne!(out.virt, 0);
        assert_eq!(file.allocations(), 1);
        assert_eq!(platform.pool.outstanding(), 1);

        // Buffers of one device are not visible through the other.
        let cma = state.cma().open();
        let err = process
            .mmap(PAGE_SIZE, out.phys, |vma| cma.mmap(vma))
            .unwrap_err();
        assert_eq!(err.errno(), libc_errno::EINVAL);
        drop(cma);

        drop(file);
        platform.pool.validate().unwrap();
    }

    #[test]
    fn shared_alloc_failures() {
        let platform = platform();
        let state = load(&platform, MxpConfig::default());
        let mut file = state.mxp().open();
        let mut process = EmulatedProcess::new(platform.phys.clone());

        // Unreadable parameter block.
        let err = file
            .ioctl(ioctl::MXP_IOCTL_SHARED_ALLOC, 0x10, &mut process)
            .unwrap_err();
        assert_eq!(err.errno(), libc_errno::EACCES);

        platform.pool.fail_next_alloc();
        let err = shared_alloc(&mut file, &mut process, 100).unwrap_err();
        assert_eq!(err.errno(), libc_errno::ENOMEM);

        let err = shared_alloc(&mut file, &mut process, 0).unwrap_err();
        assert_eq!(err.errno(), libc_errno::EINVAL);
        assert_eq!(file.allocations(), 0);
        platform.pool.validate().unwrap();
    }

    #[test]
    fn shared_alloc_copy_out_failure_frees() {
        struct ReadOnly<'a>(&'a mut EmulatedProcess);

        impl UserMemory for ReadOnly<'_> {
            fn copy_from_user(&self, addr: u64, data: &mut [u8]) -> Result<(), UserAccessError> {
                self.0.copy_from_user(addr, data)
            }

            fn copy_to_user(&mut self, addr: u64, _data: &[u8]) -> Result<(), UserAccessError> {
                Err(UserAccessError { addr })
            }
        }

        let platform = platform();
        let state = load(&platform, MxpConfig::default());
        let mut file = state.mxp().open();
        let mut process = EmulatedProcess::new(platform.phys.clone());
        let arg = process.alloc_user_buffer(size_of::<SharedAlloc>());
        process
            .copy_to_user(arg, SharedAlloc { len: 1, ..Default::default() }.as_bytes())
            .unwrap();

        let err = file
            .ioctl(ioctl::MXP_IOCTL_SHARED_ALLOC, arg, &mut ReadOnly(&mut process))
            .unwrap_err();
        assert_eq!(err.errno(), libc_errno::EACCES);
        assert_eq!(file.allocations(), 0);
        platform.pool.validate().unwrap();
    }

    #[test]
    fn attributes_override_windows() {
        let layout = BoardLayout::default();
        let config = MxpConfig {
            scratchpad_base: 0xa000_0000,
            scratchpad_size: 0x20000,
            ..Default::default()
        };
        let platform = EmulatedPlatform::new(&config, &layout).unwrap();
        let state = DriverState::load(
            &platform.services(),
            AttributeTable::from_properties([
                ("vblx,s_axi_baseaddr", 0xa000_0000),
                ("vblx,scratchpad_kb", 128),
            ])
            .unwrap(),
            MxpConfig::default(),
        )
        .unwrap();
        assert_eq!(state.config(), &config);
        assert_eq!(state.mxp().windows().scratchpad().base, 0xa000_0000);
    }

    mod libc_errno {
        pub const ENOMEM: i32 = mxp_defs::ErrorClass::NoMemory.errno();
        pub const EACCES: i32 = mxp_defs::ErrorClass::Access.errno();
        pub const EINVAL: i32 = mxp_defs::ErrorClass::InvalidArgument.errno();
        pub const EAGAIN: i32 = mxp_defs::ErrorClass::TryAgain.errno();
    }
}
