// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Character device registration.
//!
//! A device node is brought up in four steps: reserve a device number,
//! add the cdev, create the class, create the device node. Each step is
//! undone in reverse order when the [`Registration`] is dropped, including
//! when a later step fails during load.

use crate::attrs::AttributeTable;
use std::sync::Arc;
use thiserror::Error;

/// A reserved device number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevNum {
    /// Major number.
    pub major: u32,
    /// Minor number.
    pub minor: u32,
}

/// Host handle to a registered cdev.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CdevId(pub u64);

/// Host handle to a device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u64);

/// Host handle to a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u64);

/// A host registration call failed with `errno`.
#[derive(Debug, Error)]
#[error("host returned errno {errno}")]
pub struct HostError {
    /// The positive errno value.
    pub errno: i32,
}

/// The registration step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterStep {
    /// Reserving the device number.
    DeviceNumber,
    /// Adding the cdev.
    Cdev,
    /// Creating the class.
    Class,
    /// Creating the device node.
    Device,
    /// Setting the coherent DMA mask on the device.
    DmaMask,
    /// Publishing an attribute.
    Attribute,
}

/// Error registering a device.
#[derive(Debug, Error)]
#[error("{driver}: {step:?} registration failed")]
pub struct RegisterError {
    /// The driver name.
    pub driver: &'static str,
    /// The failing step.
    pub step: RegisterStep,
    /// The host error.
    #[source]
    pub source: HostError,
}

/// Character device registration services of the host.
pub trait CharDeviceHost: Send + Sync {
    /// Reserves one device number under `name`.
    fn alloc_chrdev_region(&self, name: &str) -> Result<DevNum, HostError>;
    /// Releases a device number.
    fn unregister_chrdev_region(&self, dev: DevNum);
    /// Adds a cdev for `dev`. Opens of the node are routed to the driver from
    /// here on.
    fn cdev_add(&self, dev: DevNum) -> Result<CdevId, HostError>;
    /// Removes a cdev.
    fn cdev_del(&self, cdev: CdevId);
    /// Creates a device class.
    fn class_create(&self, name: &str) -> Result<ClassId, HostError>;
    /// Destroys a device class.
    fn class_destroy(&self, class: ClassId);
    /// Creates the device node `node` for `dev` in `class`.
    fn device_create(&self, class: ClassId, dev: DevNum, node: &str)
        -> Result<DeviceId, HostError>;
    /// Destroys a device node.
    fn device_destroy(&self, class: ClassId, dev: DevNum);
    /// Sets the device's coherent DMA mask.
    fn set_coherent_mask(&self, device: DeviceId, mask: u64) -> Result<(), HostError>;
}

/// Publishes read-only attributes on a device node.
pub trait AttributePublisher: Send + Sync {
    /// Publishes `name` with the formatted `value`.
    fn publish(&self, device: DeviceId, name: &str, value: &str) -> Result<(), HostError>;
    /// Removes a published attribute.
    fn unpublish(&self, device: DeviceId, name: &str);
}

/// A registered device node. Dropping it unregisters everything acquired,
/// in reverse order.
pub struct Registration {
    host: Arc<dyn CharDeviceHost>,
    driver: &'static str,
    dev: DevNum,
    cdev: Option<CdevId>,
    class: Option<ClassId>,
    device: Option<DeviceId>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("driver", &self.driver)
            .field("dev", &self.dev)
            .field("device", &self.device)
            .finish()
    }
}

impl Registration {
    /// Registers the device node `node` of driver `driver` with its DMA mask
    /// set to `dma_mask`.
    pub fn register(
        host: Arc<dyn CharDeviceHost>,
        driver: &'static str,
        node: &str,
        dma_mask: u64,
    ) -> Result<Self, RegisterError> {
        let fail = |step: RegisterStep| move |source: HostError| RegisterError {
            driver,
            step,
            source,
        };

        let dev = host
            .alloc_chrdev_region(driver)
            .map_err(fail(RegisterStep::DeviceNumber))?;
        let mut this = Self {
            host,
            driver,
            dev,
            cdev: None,
            class: None,
            device: None,
        };

        this.cdev = Some(this.host.cdev_add(dev).map_err(fail(RegisterStep::Cdev))?);
        let class = this
            .host
            .class_create(driver)
            .map_err(fail(RegisterStep::Class))?;
        this.class = Some(class);
        let device = this
            .host
            .device_create(class, dev, node)
            .map_err(fail(RegisterStep::Device))?;
        this.device = Some(device);
        this.host
            .set_coherent_mask(device, dma_mask)
            .map_err(fail(RegisterStep::DmaMask))?;

        tracing::info!(driver, node, major = dev.major, minor = dev.minor, "registered");
        Ok(this)
    }

    /// The device number.
    pub fn dev(&self) -> DevNum {
        self.dev
    }

    /// The device node handle.
    pub fn device(&self) -> DeviceId {
        self.device.expect("set by register")
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(class) = self.class {
            if self.device.take().is_some() {
                self.host.device_destroy(class, self.dev);
            }
        }
        if let Some(class) = self.class.take() {
            self.host.class_destroy(class);
        }
        if let Some(cdev) = self.cdev.take() {
            self.host.cdev_del(cdev);
        }
        self.host.unregister_chrdev_region(self.dev);
        tracing::debug!(driver = self.driver, "unregistered");
    }
}

/// Attributes published on a device node. Dropping it removes them.
pub struct PublishedAttributes {
    publisher: Arc<dyn AttributePublisher>,
    device: DeviceId,
    names: Vec<String>,
}

impl std::fmt::Debug for PublishedAttributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishedAttributes")
            .field("device", &self.device)
            .field("names", &self.names)
            .finish_non_exhaustive()
    }
}

impl PublishedAttributes {
    /// Publishes every entry of `table` on `device`. On failure, the entries
    /// published so far are removed.
    pub fn publish(
        publisher: Arc<dyn AttributePublisher>,
        driver: &'static str,
        device: DeviceId,
        table: &AttributeTable,
    ) -> Result<Self, RegisterError> {
        let mut this = Self {
            publisher,
            device,
            names: Vec::with_capacity(table.len()),
        };
        for (name, value) in table.iter() {
            this.publisher
                .publish(device, name, &crate::attrs::format_value(value))
                .map_err(|source| RegisterError {
                    driver,
                    step: RegisterStep::Attribute,
                    source,
                })?;
            this.names.push(name.to_owned());
        }
        Ok(this)
    }

    /// The number of published attributes.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns true if nothing was published.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Drop for PublishedAttributes {
    fn drop(&mut self) {
        for name in self.names.drain(..).rev() {
            self.publisher.unpublish(self.device, &name);
        }
    }
}
