// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The device-tree attribute table.
//!
//! Built once at load from the device's platform properties and read-only
//! afterwards. Each entry is published as a read-only attribute of the
//! accelerator device.

use std::collections::BTreeMap;
use thiserror::Error;

/// Maximum number of attributes a device may carry.
pub const ATTRIBUTE_CAPACITY: usize = 320;

/// Maximum length of a normalized attribute name.
pub const MAX_NAME_LEN: usize = 32;

/// Error building an [`AttributeTable`].
#[derive(Debug, Error)]
pub enum AttributeError {
    /// More than [`ATTRIBUTE_CAPACITY`] properties were supplied.
    #[error("more than {ATTRIBUTE_CAPACITY} attributes")]
    Capacity,
    /// A name is empty after its prefix is removed.
    #[error("property {0:?} has an empty name")]
    EmptyName(String),
    /// A name is longer than [`MAX_NAME_LEN`] after normalization.
    #[error("attribute name {0:?} is longer than {MAX_NAME_LEN} characters")]
    NameTooLong(String),
    /// Two properties normalize to the same name.
    #[error("duplicate attribute {0:?}")]
    Duplicate(String),
}

/// Normalizes a property name: drops everything up to and including the
/// first `,` and upper-cases the rest.
///
/// `vblx,vector_lanes` becomes `VECTOR_LANES`.
pub fn normalize_name(property: &str) -> Result<String, AttributeError> {
    let bare = property
        .split_once(',')
        .map_or(property, |(_prefix, rest)| rest);
    if bare.is_empty() {
        return Err(AttributeError::EmptyName(property.to_owned()));
    }
    let name = bare.to_ascii_uppercase();
    if name.len() > MAX_NAME_LEN {
        return Err(AttributeError::NameTooLong(name));
    }
    Ok(name)
}

/// Attribute name to integer value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeTable {
    entries: BTreeMap<String, u64>,
}

impl AttributeTable {
    /// Builds the table from raw property names and values.
    pub fn from_properties<S: AsRef<str>>(
        properties: impl IntoIterator<Item = (S, u64)>,
    ) -> Result<Self, AttributeError> {
        let mut entries = BTreeMap::new();
        for (property, value) in properties {
            if entries.len() == ATTRIBUTE_CAPACITY {
                return Err(AttributeError::Capacity);
            }
            let name = normalize_name(property.as_ref())?;
            if entries.contains_key(&name) {
                return Err(AttributeError::Duplicate(name));
            }
            entries.insert(name, value);
        }
        Ok(Self { entries })
    }

    /// The synthesis parameters of the reference hardware, for platforms
    /// without a device-tree node.
    pub fn hardware_defaults() -> Self {
        Self {
            entries: mxp_defs::xpar::ALL
                .iter()
                .map(|&(name, value)| (name.to_owned(), value))
                .collect(),
        }
    }

    /// Looks up an attribute by normalized name.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.entries.get(name).copied()
    }

    /// Formats an attribute the way it is read back by userspace.
    pub fn show(&self, name: &str) -> Option<String> {
        self.get(name).map(format_value)
    }

    /// Iterates over the entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(k, &v)| (k.as_str(), v))
    }

    /// The number of attributes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Formats an attribute value.
pub fn format_value(value: u64) -> String {
    format!("{value:#x}")
}
