// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An emulated host: physical memory and a process address space that runs
//! mmap handlers against [`VmArea`].
//!
//! Used by tests and the simulator to exercise the driver core without a
//! kernel.

use crate::host::AllocError;
use crate::host::CacheAttr;
use crate::host::PrivateSlot;
use crate::host::RemapError;
use crate::host::UserAccessError;
use crate::host::UserMemory;
use crate::host::VmArea;
use crate::host::VmFlags;
use crate::MappingAssociation;
use mxp_defs::PAGE_SIZE;
use mxp_defs::PAGE_SIZE64;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

/// Base of the emulated kernel linear map. CPU addresses handed out by
/// emulated coherent allocators are `LINEAR_MAP_BASE + phys`.
pub const LINEAR_MAP_BASE: u64 = 0xffff_8880_0000_0000;

/// Error returned when physical memory is accessed outside any range.
#[derive(Debug, Error)]
#[error("no physical memory at {addr:#x} ({len:#x} bytes)")]
pub struct PhysAccessError {
    /// The start of the access.
    pub addr: u64,
    /// The access length.
    pub len: usize,
}

struct PhysRange {
    name: String,
    base: u64,
    data: Vec<u8>,
}

/// Emulated physical address space made of named RAM and device ranges.
#[derive(Clone, Default)]
pub struct PhysicalMemory {
    ranges: Arc<Mutex<Vec<PhysRange>>>,
}

impl std::fmt::Debug for PhysicalMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ranges = self.ranges.lock();
        let mut map = f.debug_map();
        for r in ranges.iter() {
            map.entry(&r.name, &format_args!("{:#x}+{:#x}", r.base, r.data.len()));
        }
        map.finish()
    }
}

impl PhysicalMemory {
    /// Creates an empty physical address space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a zeroed range. `base` and `len` must be page aligned and the
    /// range must not overlap an existing one.
    pub fn add_range(&self, name: &str, base: u64, len: usize) {
        assert_eq!(base % PAGE_SIZE64, 0);
        assert_eq!(len % PAGE_SIZE, 0);
        let mut ranges = self.ranges.lock();
        let end = base + len as u64;
        for r in ranges.iter() {
            let r_end = r.base + r.data.len() as u64;
            assert!(
                end <= r.base || base >= r_end,
                "{name} overlaps {}",
                r.name
            );
        }
        ranges.push(PhysRange {
            name: name.to_owned(),
            base,
            data: vec![0; len],
        });
    }

    fn with_range<R>(
        &self,
        addr: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, PhysAccessError> {
        let mut ranges = self.ranges.lock();
        let range = ranges
            .iter_mut()
            .find(|r| addr >= r.base && addr - r.base + len as u64 <= r.data.len() as u64)
            .ok_or(PhysAccessError { addr, len })?;
        let start = (addr - range.base) as usize;
        Ok(f(&mut range.data[start..start + len]))
    }

    /// Reads `data.len()` bytes at `addr`.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), PhysAccessError> {
        self.with_range(addr, data.len(), |src| data.copy_from_slice(src))
    }

    /// Writes `data` at `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), PhysAccessError> {
        self.with_range(addr, data.len(), |dst| dst.copy_from_slice(data))
    }

    /// Fills `len` bytes at `addr` with `val`.
    pub fn fill(&self, addr: u64, len: usize, val: u8) -> Result<(), PhysAccessError> {
        self.with_range(addr, len, |dst| dst.fill(val))
    }

    /// Reads a native-endian u32.
    pub fn read_u32(&self, addr: u64) -> Result<u32, PhysAccessError> {
        let mut n = [0; 4];
        self.read(addr, &mut n)?;
        Ok(u32::from_ne_bytes(n))
    }

    /// Writes a native-endian u32.
    pub fn write_u32(&self, addr: u64, val: u32) -> Result<(), PhysAccessError> {
        self.write(addr, &val.to_ne_bytes())
    }
}

/// An installed page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    /// Target page frame.
    pub pfn: u64,
    /// Cache attribute.
    pub attr: CacheAttr,
}

enum Backing {
    /// Pages come from the page table entries installed by a driver.
    Device,
    /// Ordinary process memory, used for ioctl arguments.
    Anonymous(Vec<u8>),
}

struct Area {
    len: usize,
    flags: VmFlags,
    backing: Backing,
    pages: BTreeSet<u64>,
    assoc: Option<MappingAssociation>,
}

impl Area {
    fn release(&mut self) {
        if let Some(assoc) = self.assoc.take() {
            assoc.release();
        }
    }
}

/// Error returned by [`EmulatedProcess::munmap`].
#[derive(Debug, Error)]
#[error("invalid unmap range {addr:#x} ({len:#x} bytes)")]
pub struct UnmapError {
    addr: u64,
    len: usize,
}

#[derive(Default)]
struct FaultInjection {
    private_alloc: bool,
    remap: bool,
}

/// The [`VmArea`] handed to an mmap handler. Nothing it does is visible to
/// the process until the handler succeeds.
struct EmulatedVma<'a> {
    start: u64,
    len: usize,
    pgoff: u64,
    flags: VmFlags,
    ptes: Vec<(u64, Pte)>,
    slot_reserved: bool,
    assoc: Option<MappingAssociation>,
    faults: &'a mut FaultInjection,
}

impl VmArea for EmulatedVma<'_> {
    fn start(&self) -> u64 {
        self.start
    }

    fn len(&self) -> usize {
        self.len
    }

    fn pgoff(&self) -> u64 {
        self.pgoff
    }

    fn set_flags(&mut self, flags: VmFlags) {
        self.flags = VmFlags::from_bits(self.flags.into_bits() | flags.into_bits());
    }

    fn alloc_private(&mut self) -> Result<PrivateSlot, AllocError> {
        if std::mem::take(&mut self.faults.private_alloc) {
            return Err(AllocError {
                len: size_of::<MappingAssociation>(),
            });
        }
        assert!(!self.slot_reserved, "private data reserved twice");
        self.slot_reserved = true;
        Ok(PrivateSlot::new())
    }

    fn remap_pfn_range(&mut self, pfn: u64, len: usize, attr: CacheAttr) -> Result<(), RemapError> {
        let err = RemapError {
            addr: self.start,
            pfn,
            len,
        };
        if std::mem::take(&mut self.faults.remap) || len % PAGE_SIZE != 0 || len > self.len {
            return Err(err);
        }
        let first_vpn = self.start / PAGE_SIZE64;
        for i in 0..(len / PAGE_SIZE) as u64 {
            if self.ptes.iter().any(|&(vpn, _)| vpn == first_vpn + i) {
                return Err(err);
            }
            self.ptes.push((first_vpn + i, Pte { pfn: pfn + i, attr }));
        }
        Ok(())
    }

    fn set_private(&mut self, _slot: PrivateSlot, assoc: MappingAssociation) {
        assert!(self.assoc.is_none(), "private data set twice");
        self.assoc = Some(assoc);
    }
}

/// An emulated process address space.
pub struct EmulatedProcess {
    phys: PhysicalMemory,
    next_va: u64,
    areas: BTreeMap<u64, Area>,
    ptes: BTreeMap<u64, Pte>,
    faults: FaultInjection,
}

const USER_VA_BASE: u64 = 0x7f00_0000_0000;

impl EmulatedProcess {
    /// Creates a process with an empty address space over `phys`.
    pub fn new(phys: PhysicalMemory) -> Self {
        Self {
            phys,
            next_va: USER_VA_BASE,
            areas: BTreeMap::new(),
            ptes: BTreeMap::new(),
            faults: FaultInjection::default(),
        }
    }

    /// Makes the next private data reservation fail.
    pub fn fail_next_private_alloc(&mut self) {
        self.faults.private_alloc = true;
    }

    /// Makes the next page table installation fail.
    pub fn fail_next_remap(&mut self) {
        self.faults.remap = true;
    }

    fn reserve_va(&mut self, len: usize) -> u64 {
        let va = self.next_va;
        // Leave a guard page between areas.
        self.next_va += (len + PAGE_SIZE) as u64;
        va
    }

    /// Runs an mmap request of `len` bytes at page offset `offset / PAGE_SIZE`
    /// through `handler`, returning the mapped address on success.
    pub fn mmap<T, E>(
        &mut self,
        len: usize,
        offset: u64,
        handler: impl FnOnce(&mut dyn VmArea) -> Result<T, E>,
    ) -> Result<u64, E> {
        let len = mxp_defs::page_align(len).expect("mmap length overflow");
        assert!(len != 0, "zero length mmap");
        assert_eq!(offset % PAGE_SIZE64, 0, "unaligned mmap offset");
        let start = self.reserve_va(len);

        let mut vma = EmulatedVma {
            start,
            len,
            pgoff: offset / PAGE_SIZE64,
            flags: VmFlags::new(),
            ptes: Vec::new(),
            slot_reserved: false,
            assoc: None,
            faults: &mut self.faults,
        };
        handler(&mut vma)?;

        let EmulatedVma {
            flags, ptes, assoc, ..
        } = vma;
        let first_vpn = start / PAGE_SIZE64;
        self.ptes.extend(ptes);
        self.areas.insert(
            start,
            Area {
                len,
                flags,
                backing: Backing::Device,
                pages: (first_vpn..first_vpn + (len / PAGE_SIZE) as u64).collect(),
                assoc,
            },
        );
        Ok(start)
    }

    /// Maps `len` bytes of zeroed anonymous memory.
    pub fn alloc_user_buffer(&mut self, len: usize) -> u64 {
        let len = mxp_defs::page_align(len.max(1)).expect("buffer length overflow");
        let start = self.reserve_va(len);
        let first_vpn = start / PAGE_SIZE64;
        self.areas.insert(
            start,
            Area {
                len,
                flags: VmFlags::new(),
                backing: Backing::Anonymous(vec![0; len]),
                pages: (first_vpn..first_vpn + (len / PAGE_SIZE) as u64).collect(),
                assoc: None,
            },
        );
        start
    }

    /// Unmaps every page in `addr..addr + len`. An area's association is
    /// released once its last page is gone.
    pub fn munmap(&mut self, addr: u64, len: usize) -> Result<(), UnmapError> {
        let len_aligned = mxp_defs::page_align(len).ok_or(UnmapError { addr, len })?;
        if addr % PAGE_SIZE64 != 0 || len == 0 {
            return Err(UnmapError { addr, len });
        }
        let first = addr / PAGE_SIZE64;
        let last = first + (len_aligned / PAGE_SIZE) as u64;
        let mut emptied = Vec::new();
        for (&start, area) in self.areas.range_mut(..addr + len_aligned as u64) {
            if start + area.len as u64 <= addr {
                continue;
            }
            for vpn in first..last {
                if area.pages.remove(&vpn) {
                    self.ptes.remove(&vpn);
                }
            }
            if area.pages.is_empty() {
                emptied.push(start);
            }
        }
        for start in emptied {
            if let Some(mut area) = self.areas.remove(&start) {
                area.release();
            }
        }
        Ok(())
    }

    /// Tears down the whole address space, as at process exit.
    pub fn exit(&mut self) {
        self.ptes.clear();
        for (_, mut area) in std::mem::take(&mut self.areas) {
            area.release();
        }
    }

    /// The number of live areas, including anonymous buffers.
    pub fn mapping_count(&self) -> usize {
        self.areas.len()
    }

    /// The page table entry for `va`, if one is installed.
    pub fn pte(&self, va: u64) -> Option<Pte> {
        self.ptes.get(&(va / PAGE_SIZE64)).copied()
    }

    /// The flags of the area containing `va`.
    pub fn flags(&self, va: u64) -> Option<VmFlags> {
        self.area(va).map(|(_, area)| area.flags)
    }

    fn area(&self, va: u64) -> Option<(u64, &Area)> {
        let (&start, area) = self.areas.range(..=va).next_back()?;
        let vpn = va / PAGE_SIZE64;
        (va < start + area.len as u64 && area.pages.contains(&vpn)).then_some((start, area))
    }

    /// Calls `f` for each page-bounded chunk of `va..va + len` with the
    /// resolved physical address or anonymous buffer offset.
    fn for_each_chunk(
        &mut self,
        va: u64,
        len: usize,
        mut f: impl FnMut(&PhysicalMemory, Chunk<'_>, usize) -> Result<(), PhysAccessError>,
    ) -> Result<(), UserAccessError> {
        let mut done = 0;
        while done < len {
            let addr = va + done as u64;
            let page_off = (addr % PAGE_SIZE64) as usize;
            let n = (PAGE_SIZE - page_off).min(len - done);
            let vpn = addr / PAGE_SIZE64;
            let (&start, area) = self
                .areas
                .range_mut(..=addr)
                .next_back()
                .filter(|(start, area)| {
                    addr < **start + area.len as u64 && area.pages.contains(&vpn)
                })
                .ok_or(UserAccessError { addr })?;
            let chunk = match &mut area.backing {
                Backing::Anonymous(buf) => {
                    let off = (addr - start) as usize;
                    Chunk::Anonymous(&mut buf[off..off + n])
                }
                Backing::Device => {
                    let pte = self.ptes.get(&vpn).ok_or(UserAccessError { addr })?;
                    Chunk::Phys(pte.pfn * PAGE_SIZE64 + page_off as u64, n)
                }
            };
            f(&self.phys, chunk, done).map_err(|_| UserAccessError { addr })?;
            done += n;
        }
        Ok(())
    }

    /// Reads process memory at `va`.
    pub fn read(&mut self, va: u64, data: &mut [u8]) -> Result<(), UserAccessError> {
        let len = data.len();
        self.for_each_chunk(va, len, |phys, chunk, done| match chunk {
            Chunk::Anonymous(buf) => {
                data[done..done + buf.len()].copy_from_slice(buf);
                Ok(())
            }
            Chunk::Phys(addr, n) => phys.read(addr, &mut data[done..done + n]),
        })
    }

    /// Writes process memory at `va`.
    pub fn write(&mut self, va: u64, data: &[u8]) -> Result<(), UserAccessError> {
        self.for_each_chunk(va, data.len(), |phys, chunk, done| match chunk {
            Chunk::Anonymous(buf) => {
                let n = buf.len();
                buf.copy_from_slice(&data[done..done + n]);
                Ok(())
            }
            Chunk::Phys(addr, n) => phys.write(addr, &data[done..done + n]),
        })
    }

    /// Reads a native-endian u32 at `va`.
    pub fn read_u32(&mut self, va: u64) -> Result<u32, UserAccessError> {
        let mut n = [0; 4];
        self.read(va, &mut n)?;
        Ok(u32::from_ne_bytes(n))
    }

    /// Reads a native-endian u64 at `va`.
    pub fn read_u64(&mut self, va: u64) -> Result<u64, UserAccessError> {
        let mut n = [0; 8];
        self.read(va, &mut n)?;
        Ok(u64::from_ne_bytes(n))
    }
}

enum Chunk<'a> {
    Anonymous(&'a mut [u8]),
    Phys(u64, usize),
}

impl UserMemory for EmulatedProcess {
    fn copy_from_user(&self, addr: u64, data: &mut [u8]) -> Result<(), UserAccessError> {
        let mut done = 0;
        while done < data.len() {
            let va = addr + done as u64;
            let n = (PAGE_SIZE - (va % PAGE_SIZE64) as usize).min(data.len() - done);
            let (start, area) = self.area(va).ok_or(UserAccessError { addr: va })?;
            match &area.backing {
                Backing::Anonymous(buf) => {
                    let off = (va - start) as usize;
                    data[done..done + n].copy_from_slice(&buf[off..off + n]);
                }
                Backing::Device => {
                    let pte = self.pte(va).ok_or(UserAccessError { addr: va })?;
                    self.phys
                        .read(
                            pte.pfn * PAGE_SIZE64 + va % PAGE_SIZE64,
                            &mut data[done..done + n],
                        )
                        .map_err(|_| UserAccessError { addr: va })?;
                }
            }
            done += n;
        }
        Ok(())
    }

    fn copy_to_user(&mut self, addr: u64, data: &[u8]) -> Result<(), UserAccessError> {
        self.write(addr, data)
    }
}

impl Drop for EmulatedProcess {
    fn drop(&mut self) {
        self.exit();
    }
}
