// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An emulated platform for running the drivers without a kernel: a
//! character-device host with sysfs-like attributes, and physical memory
//! holding the accelerator windows and the contiguous memory pool.

use crate::config::MxpConfig;
use crate::registry::AttributePublisher;
use crate::registry::CdevId;
use crate::registry::CharDeviceHost;
use crate::registry::ClassId;
use crate::registry::DevNum;
use crate::registry::DeviceId;
use crate::registry::HostError;
use crate::registry::RegisterStep;
use crate::HostServices;
use anyhow::Context;
use cma_pool::CmaPool;
use dma_region::emulated::PhysicalMemory;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Value the emulated instruction port reads back at offset 0.
pub const INSTR_PORT_ID: u32 = 0xdeed_feed;

/// First major number handed out by [`EmulatedHost`].
const FIRST_MAJOR: u32 = 240;

/// A host call to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFault {
    /// Fail the next device number reservation.
    DeviceNumber,
    /// Fail the next cdev add.
    Cdev,
    /// Fail the next class creation.
    Class,
    /// Fail the next device node creation.
    Device,
    /// Fail the next DMA mask update.
    DmaMask,
    /// Fail attribute publication after this many more succeed.
    AttributeAfter(usize),
}

impl HostFault {
    /// The registration step this fault breaks.
    pub fn step(&self) -> RegisterStep {
        match self {
            HostFault::DeviceNumber => RegisterStep::DeviceNumber,
            HostFault::Cdev => RegisterStep::Cdev,
            HostFault::Class => RegisterStep::Class,
            HostFault::Device => RegisterStep::Device,
            HostFault::DmaMask => RegisterStep::DmaMask,
            HostFault::AttributeAfter(_) => RegisterStep::Attribute,
        }
    }
}

#[derive(Debug)]
struct Node {
    name: String,
    class: ClassId,
    id: DeviceId,
    mask: Option<u64>,
}

#[derive(Debug, Default)]
struct HostState {
    next_id: u64,
    next_major: u32,
    regions: BTreeMap<DevNum, String>,
    cdevs: BTreeMap<u64, DevNum>,
    classes: BTreeMap<u64, String>,
    nodes: BTreeMap<DevNum, Node>,
    attributes: BTreeMap<(u64, String), String>,
    fault: Option<HostFault>,
}

impl HostState {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check(&mut self, step: HostFault) -> Result<(), HostError> {
        if self.fault == Some(step) {
            self.fault = None;
            return Err(HostError {
                errno: fault_errno(step),
            });
        }
        Ok(())
    }
}

fn fault_errno(fault: HostFault) -> i32 {
    match fault {
        HostFault::DeviceNumber => mxp_defs::ErrorClass::TryAgain.errno(),
        HostFault::DmaMask => mxp_defs::ErrorClass::InvalidArgument.errno(),
        _ => mxp_defs::ErrorClass::NoMemory.errno(),
    }
}

/// Character-device host and attribute publisher keeping all state in
/// memory.
#[derive(Debug)]
pub struct EmulatedHost {
    state: Mutex<HostState>,
}

impl EmulatedHost {
    /// Creates an empty host.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState {
                next_major: FIRST_MAJOR,
                ..Default::default()
            }),
        }
    }

    /// Makes a later host call fail.
    pub fn inject(&self, fault: HostFault) {
        self.state.lock().fault = Some(fault);
    }

    /// Returns true if a device node named `node` exists.
    pub fn has_node(&self, node: &str) -> bool {
        self.state.lock().nodes.values().any(|n| n.name == node)
    }

    /// The coherent DMA mask set on `node`.
    pub fn coherent_mask(&self, node: &str) -> Option<u64> {
        self.state
            .lock()
            .nodes
            .values()
            .find(|n| n.name == node)
            .and_then(|n| n.mask)
    }

    /// Reads attribute `name` of `node`, as `cat` on its sysfs file would.
    pub fn read_attribute(&self, node: &str, name: &str) -> Option<String> {
        let state = self.state.lock();
        let id = state.nodes.values().find(|n| n.name == node)?.id;
        state.attributes.get(&(id.0, name.to_owned())).cloned()
    }

    /// Lists the attributes of `node` in name order.
    pub fn attributes(&self, node: &str) -> Vec<(String, String)> {
        let state = self.state.lock();
        let Some(id) = state.nodes.values().find(|n| n.name == node).map(|n| n.id) else {
            return Vec::new();
        };
        state
            .attributes
            .iter()
            .filter(|((dev, _), _)| *dev == id.0)
            .map(|((_, name), value)| (name.clone(), value.clone()))
            .collect()
    }

    /// The number of published attributes across all nodes.
    pub fn attribute_count(&self) -> usize {
        self.state.lock().attributes.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_clean(&self) -> bool {
        let state = self.state.lock();
        state.regions.is_empty()
            && state.cdevs.is_empty()
            && state.classes.is_empty()
            && state.nodes.is_empty()
            && state.attributes.is_empty()
    }
}

impl Default for EmulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl CharDeviceHost for EmulatedHost {
    fn alloc_chrdev_region(&self, name: &str) -> Result<DevNum, HostError> {
        let mut state = self.state.lock();
        state.check(HostFault::DeviceNumber)?;
        let dev = DevNum {
            major: state.next_major,
            minor: 0,
        };
        state.next_major += 1;
        state.regions.insert(dev, name.to_owned());
        Ok(dev)
    }

    fn unregister_chrdev_region(&self, dev: DevNum) {
        let removed = self.state.lock().regions.remove(&dev);
        assert!(removed.is_some(), "device number {dev:?} not reserved");
    }

    fn cdev_add(&self, dev: DevNum) -> Result<CdevId, HostError> {
        let mut state = self.state.lock();
        state.check(HostFault::Cdev)?;
        assert!(state.regions.contains_key(&dev));
        let id = state.id();
        state.cdevs.insert(id, dev);
        Ok(CdevId(id))
    }

    fn cdev_del(&self, cdev: CdevId) {
        let removed = self.state.lock().cdevs.remove(&cdev.0);
        assert!(removed.is_some(), "cdev {cdev:?} not added");
    }

    fn class_create(&self, name: &str) -> Result<ClassId, HostError> {
        let mut state = self.state.lock();
        state.check(HostFault::Class)?;
        let id = state.id();
        state.classes.insert(id, name.to_owned());
        Ok(ClassId(id))
    }

    fn class_destroy(&self, class: ClassId) {
        let mut state = self.state.lock();
        assert!(
            !state.nodes.values().any(|n| n.class == class),
            "class destroyed with live devices"
        );
        let removed = state.classes.remove(&class.0);
        assert!(removed.is_some(), "class {class:?} not created");
    }

    fn device_create(
        &self,
        class: ClassId,
        dev: DevNum,
        node: &str,
    ) -> Result<DeviceId, HostError> {
        let mut state = self.state.lock();
        state.check(HostFault::Device)?;
        assert!(state.classes.contains_key(&class.0));
        let id = DeviceId(state.id());
        state.nodes.insert(
            dev,
            Node {
                name: node.to_owned(),
                class,
                id,
                mask: None,
            },
        );
        Ok(id)
    }

    fn device_destroy(&self, class: ClassId, dev: DevNum) {
        let mut state = self.state.lock();
        let node = state.nodes.remove(&dev).expect("device not created");
        assert_eq!(node.class, class);
        assert!(
            !state.attributes.keys().any(|(id, _)| *id == node.id.0),
            "device destroyed with published attributes"
        );
    }

    fn set_coherent_mask(&self, device: DeviceId, mask: u64) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.check(HostFault::DmaMask)?;
        let node = state
            .nodes
            .values_mut()
            .find(|n| n.id == device)
            .expect("unknown device");
        node.mask = Some(mask);
        Ok(())
    }
}

impl AttributePublisher for EmulatedHost {
    fn publish(&self, device: DeviceId, name: &str, value: &str) -> Result<(), HostError> {
        let mut state = self.state.lock();
        if let Some(HostFault::AttributeAfter(n)) = state.fault {
            if n == 0 {
                state.fault = None;
                return Err(HostError {
                    errno: mxp_defs::ErrorClass::NoMemory.errno(),
                });
            }
            state.fault = Some(HostFault::AttributeAfter(n - 1));
        }
        let prev = state
            .attributes
            .insert((device.0, name.to_owned()), value.to_owned());
        assert!(prev.is_none(), "attribute {name} published twice");
        Ok(())
    }

    fn unpublish(&self, device: DeviceId, name: &str) {
        let removed = self
            .state
            .lock()
            .attributes
            .remove(&(device.0, name.to_owned()));
        assert!(removed.is_some(), "attribute {name} not published");
    }
}

/// Physical layout of an emulated board.
#[derive(Debug, Clone)]
pub struct BoardLayout {
    /// Base of the contiguous memory pool.
    pub pool_base: u64,
    /// Size of the contiguous memory pool.
    pub pool_size: u64,
    /// Bus address minus CPU physical address for pool memory.
    pub bus_offset: u64,
}

impl Default for BoardLayout {
    fn default() -> Self {
        Self {
            pool_base: 0x1000_0000,
            pool_size: 16 << 20,
            bus_offset: 0,
        }
    }
}

/// An emulated board: host services, physical memory with the accelerator
/// windows, and the contiguous pool.
pub struct EmulatedPlatform {
    /// The character-device host.
    pub host: Arc<EmulatedHost>,
    /// Physical memory.
    pub phys: PhysicalMemory,
    /// The contiguous memory pool.
    pub pool: CmaPool,
}

impl EmulatedPlatform {
    /// Builds a board for the windows of `config` and the pool of `layout`.
    pub fn new(config: &MxpConfig, layout: &BoardLayout) -> anyhow::Result<Self> {
        config.validate().context("invalid window configuration")?;
        anyhow::ensure!(
            layout.pool_base % mxp_defs::PAGE_SIZE64 == 0
                && layout.pool_size % mxp_defs::PAGE_SIZE64 == 0,
            "pool range {:#x}+{:#x} is not page aligned",
            layout.pool_base,
            layout.pool_size
        );
        anyhow::ensure!(layout.pool_size != 0, "pool of size 0 not supported");
        let ranges = [
            ("instruction port", config.instr_port_base, mxp_defs::PAGE_SIZE64),
            ("scratchpad", config.scratchpad_base, config.scratchpad_size),
            ("cma", layout.pool_base, layout.pool_size),
        ];
        for (i, &(a, a_base, a_size)) in ranges.iter().enumerate() {
            for &(b, b_base, b_size) in &ranges[i + 1..] {
                if a_base < b_base.saturating_add(b_size)
                    && b_base < a_base.saturating_add(a_size)
                {
                    anyhow::bail!("{a} and {b} overlap");
                }
            }
        }

        let phys = PhysicalMemory::new();
        phys.add_range("instruction port", config.instr_port_base, mxp_defs::PAGE_SIZE);
        phys.add_range(
            "scratchpad",
            config.scratchpad_base,
            config.scratchpad_size.try_into().context("scratchpad too large")?,
        );
        phys.add_range(
            "cma",
            layout.pool_base,
            layout.pool_size.try_into().context("pool too large")?,
        );
        phys.write_u32(config.instr_port_base, INSTR_PORT_ID)?;

        let pool = CmaPool::new(
            phys.clone(),
            layout.pool_base,
            layout.pool_size,
            layout.bus_offset,
        )?;

        Ok(Self {
            host: Arc::new(EmulatedHost::new()),
            phys,
            pool,
        })
    }

    /// The services a driver instance is loaded with.
    pub fn services(&self) -> HostServices {
        HostServices {
            chardev: self.host.clone(),
            publisher: self.host.clone(),
            cma_allocator: Arc::new(self.pool.allocator(mxp_defs::names::CMA_NODE)),
            mxp_allocator: Arc::new(self.pool.allocator(mxp_defs::names::MXP_NODE)),
        }
    }
}
