// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reads the accelerator's device-tree node.

use crate::attrs::AttributeTable;
use anyhow::Context;
use std::path::Path;
use std::path::PathBuf;

/// A source of integer platform properties, read once at load.
pub trait DeviceTreeSource {
    /// Returns the node's integer properties as `(raw name, value)`.
    fn read_properties(&self) -> anyhow::Result<Vec<(String, u64)>>;
}

/// A device-tree node exposed as a directory with one file per property,
/// as under `/proc/device-tree`.
///
/// Only vendor properties (`vendor,name`) holding a single 32-bit or 64-bit
/// big-endian cell are read. Everything else (`compatible`, `reg`, string
/// properties) is skipped.
#[derive(Debug, Clone)]
pub struct ProcDeviceTreeNode {
    path: PathBuf,
}

impl ProcDeviceTreeNode {
    /// Opens the node at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_owned(),
        }
    }
}

fn decode_cell(data: &[u8]) -> Option<u64> {
    if let Ok(cell) = <[u8; 4]>::try_from(data) {
        return Some(u32::from_be_bytes(cell).into());
    }
    <[u8; 8]>::try_from(data).ok().map(u64::from_be_bytes)
}

impl ProcDeviceTreeNode {
    fn read_dir(&self) -> anyhow::Result<Vec<(String, u64)>> {
        let mut properties = Vec::new();
        for entry in fs_err::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !name.contains(',') {
                continue;
            }
            let data = fs_err::read(entry.path())?;
            match decode_cell(&data) {
                Some(value) => properties.push((name, value)),
                None => {
                    tracing::trace!(
                        name = %name,
                        len = data.len(),
                        "skipping non-integer property"
                    );
                }
            }
        }
        properties.sort();
        Ok(properties)
    }
}

impl DeviceTreeSource for ProcDeviceTreeNode {
    fn read_properties(&self) -> anyhow::Result<Vec<(String, u64)>> {
        self.read_dir()
            .with_context(|| format!("failed to read device-tree node {}", self.path.display()))
    }
}

/// Properties supplied directly, for platforms without a device tree.
impl DeviceTreeSource for [(&str, u64)] {
    fn read_properties(&self) -> anyhow::Result<Vec<(String, u64)>> {
        Ok(self
            .iter()
            .map(|&(name, value)| (name.to_owned(), value))
            .collect())
    }
}

/// Builds the attribute table from `source`.
pub fn load_attributes<S: DeviceTreeSource + ?Sized>(source: &S) -> anyhow::Result<AttributeTable> {
    let properties = source.read_properties()?;
    AttributeTable::from_properties(properties).context("invalid device-tree attributes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    fn node() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path();
        fs_err::write(p.join("name"), b"mxp\0").unwrap();
        fs_err::write(p.join("compatible"), b"vblx,mxp-1.0\0").unwrap();
        fs_err::write(p.join("vblx,vector_lanes"), 2u32.to_be_bytes()).unwrap();
        fs_err::write(p.join("vblx,s_axi_baseaddr"), 0xb000_0000u32.to_be_bytes()).unwrap();
        fs_err::write(p.join("vblx,clock_freq_hz"), 100_000_000u64.to_be_bytes()).unwrap();
        fs_err::write(p.join("vblx,label"), b"mxp0\0").unwrap();
        fs_err::create_dir(p.join("vblx,subnode")).unwrap();
        dir
    }

    #[test]
    fn reads_integer_properties() {
        let dir = node();
        let props = ProcDeviceTreeNode::new(dir.path()).read_properties().unwrap();
        assert_eq!(
            props,
            [
                ("vblx,clock_freq_hz".to_owned(), 100_000_000),
                ("vblx,s_axi_baseaddr".to_owned(), 0xb000_0000),
                ("vblx,vector_lanes".to_owned(), 2),
            ]
        );
    }

    #[test]
    fn loads_table() {
        let dir = node();
        let table = load_attributes(&ProcDeviceTreeNode::new(dir.path())).unwrap();
        assert_eq!(table.show("VECTOR_LANES").as_deref(), Some("0x2"));
        assert_eq!(table.get("CLOCK_FREQ_HZ"), Some(100_000_000));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn missing_node() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_attributes(&ProcDeviceTreeNode::new(dir.path().join("nope"))).unwrap_err();
        assert!(format!("{err:#}").contains("nope"));
    }

    #[test]
    fn slice_source() {
        let props: &[(&str, u64)] = &[("vblx,vector_lanes", 4)];
        assert_eq!(
            props.read_properties().unwrap(),
            [("vblx,vector_lanes".to_owned(), 4)]
        );
        let props: &[(&str, u64)] = &[("vblx,vector_lanes", 4), ("xlnx,VECTOR_LANES", 4)];
        load_attributes(props).unwrap_err();
    }
}
