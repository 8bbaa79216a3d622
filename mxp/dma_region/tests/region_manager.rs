// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Region manager tests against the contiguous memory pool.

use cma_pool::CmaPool;
use dma_region::emulated::EmulatedProcess;
use dma_region::emulated::PhysicalMemory;
use dma_region::RegionError;
use dma_region::RegionManager;
use dma_region::REGION_CACHE_ATTR;
use mxp_defs::ErrorClass;
use mxp_defs::DMA_BIT_MASK_32;
use mxp_defs::PAGE_SIZE;
use mxp_defs::PAGE_SIZE64;
use std::sync::Arc;
use test_with_tracing::test;

const RAM_BASE: u64 = 0x1000_0000;
const RAM_PAGES: usize = 64;

fn setup_with_bus_offset(bus_offset: u64) -> (PhysicalMemory, CmaPool, RegionManager) {
    let phys = PhysicalMemory::new();
    phys.add_range("ram", RAM_BASE, RAM_PAGES * PAGE_SIZE);
    let pool = CmaPool::new(
        phys.clone(),
        RAM_BASE,
        RAM_PAGES as u64 * PAGE_SIZE64,
        bus_offset,
    )
    .unwrap();
    let manager = RegionManager::new(Arc::new(pool.allocator("test")), DMA_BIT_MASK_32);
    (phys, pool, manager)
}

fn setup() -> (PhysicalMemory, CmaPool, RegionManager) {
    setup_with_bus_offset(0)
}

/// Maps a fresh owning region, returning its address and bus address.
fn map_owner(process: &mut EmulatedProcess, manager: &RegionManager, len: usize) -> (u64, u64) {
    let mut info = None;
    let va = process
        .mmap(len, 0, |vma| {
            info = Some(manager.allocate_and_map(vma)?);
            Ok::<_, RegionError>(())
        })
        .unwrap();
    (va, info.unwrap().bus_addr)
}

#[test]
fn allocate_rounds_to_pages() {
    let (_phys, pool, manager) = setup();
    let region = manager.allocate(1).unwrap();
    assert_eq!(region.len(), PAGE_SIZE);
    let region2 = manager.allocate(PAGE_SIZE + 1).unwrap();
    assert_eq!(region2.len(), 2 * PAGE_SIZE);
    assert_eq!(manager.live_regions(), 2);
    drop(region);
    drop(region2);
    assert_eq!(manager.live_regions(), 0);
    pool.validate().unwrap();
}

#[test]
fn allocate_rejects_zero() {
    let (_phys, _pool, manager) = setup();
    let err = manager.allocate(0).unwrap_err();
    assert!(matches!(err, RegionError::InvalidLength(0)));
    assert_eq!(err.class(), ErrorClass::InvalidArgument);
}

#[test]
fn mapping_is_zeroed_and_uncached() {
    let (phys, pool, manager) = setup();
    // Dirty the RAM so zeroing is observable.
    phys.fill(RAM_BASE, RAM_PAGES * PAGE_SIZE, 0xa5).unwrap();

    let mut process = EmulatedProcess::new(phys);
    let va = process
        .mmap(3 * PAGE_SIZE - 7, 0, |vma| manager.allocate_and_map(vma))
        .unwrap();

    let mut buf = vec![0xffu8; 3 * PAGE_SIZE];
    process.read(va, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
    let pte = process.pte(va).unwrap();
    assert_eq!(pte.attr, REGION_CACHE_ATTR);
    assert!(process.flags(va).unwrap().dont_expand());
    assert_eq!(pool.outstanding(), 1);

    process.munmap(va, 3 * PAGE_SIZE).unwrap();
    pool.validate().unwrap();
}

#[test]
fn partial_unmap_does_not_release() {
    let (phys, pool, manager) = setup();
    let mut process = EmulatedProcess::new(phys);
    let (va, _) = map_owner(&mut process, &manager, 2 * PAGE_SIZE);

    process.munmap(va, PAGE_SIZE).unwrap();
    assert_eq!(pool.outstanding(), 1);

    process.munmap(va + PAGE_SIZE64, PAGE_SIZE).unwrap();
    pool.validate().unwrap();
}

#[test]
fn process_exit_releases() {
    let (phys, pool, manager) = setup();
    let mut process = EmulatedProcess::new(phys);
    for _ in 0..3 {
        map_owner(&mut process, &manager, PAGE_SIZE);
    }
    assert_eq!(pool.outstanding(), 3);
    process.exit();
    pool.validate().unwrap();
}

#[test]
fn allocation_failure_leaves_nothing() {
    let (phys, pool, manager) = setup();
    pool.fail_next_alloc();
    let mut process = EmulatedProcess::new(phys);
    let err = process
        .mmap(PAGE_SIZE, 0, |vma| manager.allocate_and_map(vma))
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::NoMemory);
    assert_eq!(process.mapping_count(), 0);
    pool.validate().unwrap();
}

#[test]
fn association_failure_unwinds() {
    let (phys, pool, manager) = setup();
    let mut process = EmulatedProcess::new(phys);
    process.fail_next_private_alloc();
    let err = process
        .mmap(PAGE_SIZE, 0, |vma| manager.allocate_and_map(vma))
        .unwrap_err();
    assert!(matches!(err, RegionError::Association(_)));
    assert_eq!(err.class(), ErrorClass::NoMemory);
    assert_eq!(manager.live_regions(), 0);
    pool.validate().unwrap();
}

#[test]
fn remap_failure_unwinds() {
    let (phys, pool, manager) = setup();
    let mut process = EmulatedProcess::new(phys);
    process.fail_next_remap();
    let err = process
        .mmap(PAGE_SIZE, 0, |vma| manager.allocate_and_map(vma))
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::TryAgain);
    assert_eq!(process.mapping_count(), 0);
    pool.validate().unwrap();
}

#[test]
fn view_does_not_free() {
    let (phys, pool, manager) = setup();
    let region = manager.allocate(4 * PAGE_SIZE).unwrap();
    let bus = region.bus_addr();

    let mut process = EmulatedProcess::new(phys);
    let va = process
        .mmap(2 * PAGE_SIZE, 0, |vma| {
            manager.remap_existing(vma, bus + PAGE_SIZE64)
        })
        .unwrap();

    // The view sees the second page of the region.
    let pte = process.pte(va).unwrap();
    assert_eq!(pte.pfn, mxp_defs::pfn(region.phys_addr()) + 1);

    process.munmap(va, 2 * PAGE_SIZE).unwrap();
    assert_eq!(pool.outstanding(), 1);

    drop(region);
    pool.validate().unwrap();
}

#[test]
fn view_and_owner_share_memory() {
    let (phys, _pool, manager) = setup();
    let mut process = EmulatedProcess::new(phys);
    let (owner_va, bus) = map_owner(&mut process, &manager, PAGE_SIZE);
    let view_va = process
        .mmap(PAGE_SIZE, 0, |vma| manager.remap_existing(vma, bus))
        .unwrap();

    process.write(owner_va + 8, &[1, 2, 3, 4]).unwrap();
    let mut buf = [0; 4];
    process.read(view_va + 8, &mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4]);
}

#[test]
fn view_outlives_owner_mapping() {
    let (phys, pool, manager) = setup();
    let mut owner = EmulatedProcess::new(phys.clone());
    let mut viewer = EmulatedProcess::new(phys.clone());
    let (owner_va, bus) = map_owner(&mut owner, &manager, PAGE_SIZE);
    owner.write(owner_va, &0x1234u32.to_ne_bytes()).unwrap();
    let view_va = viewer
        .mmap(PAGE_SIZE, 0, |vma| manager.remap_existing(vma, bus))
        .unwrap();

    owner.munmap(owner_va, PAGE_SIZE).unwrap();
    assert_eq!(pool.outstanding(), 1);
    assert_eq!(manager.live_regions(), 0);

    // The pages are still in use, so a new buffer lands elsewhere and cannot
    // be seen through the old view.
    let mut other = EmulatedProcess::new(phys);
    let (other_va, other_bus) = map_owner(&mut other, &manager, PAGE_SIZE);
    assert_ne!(other_bus, bus);
    other.write(other_va, &0x5ec2e7u32.to_ne_bytes()).unwrap();
    assert_eq!(viewer.read_u32(view_va).unwrap(), 0x1234);

    // Without an owner the region can no longer be re-mapped.
    let err = viewer
        .mmap(PAGE_SIZE, 0, |vma| manager.remap_existing(vma, bus))
        .unwrap_err();
    assert!(matches!(err, RegionError::UnknownRegion { .. }));

    viewer.munmap(view_va, PAGE_SIZE).unwrap();
    assert_eq!(pool.outstanding(), 1);
    drop(other);
    pool.validate().unwrap();
}

#[test]
fn view_outlives_dropped_region() {
    let (phys, pool, manager) = setup();
    let region = manager.allocate(2 * PAGE_SIZE).unwrap();
    let bus = region.bus_addr();
    let mut process = EmulatedProcess::new(phys);
    let view_va = process
        .mmap(PAGE_SIZE, 0, |vma| manager.remap_existing(vma, bus + PAGE_SIZE64))
        .unwrap();

    drop(region);
    assert_eq!(pool.outstanding(), 1);
    process.exit();
    pool.validate().unwrap();
    assert_eq!(process.mapping_count(), 0);
    assert!(process.read_u32(view_va).is_err());
}

#[test]
fn remap_unknown_bus_address() {
    let (phys, _pool, manager) = setup();
    let region = manager.allocate(PAGE_SIZE).unwrap();
    let mut process = EmulatedProcess::new(phys);

    // Past the end of the region.
    let err = process
        .mmap(2 * PAGE_SIZE, 0, |vma| {
            manager.remap_existing(vma, region.bus_addr())
        })
        .unwrap_err();
    assert!(matches!(err, RegionError::UnknownRegion { .. }));

    let err = process
        .mmap(PAGE_SIZE, 0, |vma| manager.remap_existing(vma, 0x8000_0000))
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidArgument);

    let err = process
        .mmap(PAGE_SIZE, 0, |vma| {
            manager.remap_existing(vma, region.bus_addr() + 1)
        })
        .unwrap_err();
    assert!(matches!(err, RegionError::Unaligned(_)));
}

#[test]
fn released_region_cannot_be_remapped() {
    let (phys, _pool, manager) = setup();
    let region = manager.allocate(PAGE_SIZE).unwrap();
    let bus = region.bus_addr();
    drop(region);

    let mut process = EmulatedProcess::new(phys);
    let err = process
        .mmap(PAGE_SIZE, 0, |vma| manager.remap_existing(vma, bus))
        .unwrap_err();
    assert!(matches!(err, RegionError::UnknownRegion { .. }));
}

#[test]
fn bus_address_differs_from_phys() {
    let (phys, _pool, manager) = setup_with_bus_offset(0x4000_0000);
    let mut process = EmulatedProcess::new(phys);
    let (va, bus) = map_owner(&mut process, &manager, PAGE_SIZE);
    assert_eq!(bus, RAM_BASE + 0x4000_0000);
    // The page tables point at the CPU physical address, not the bus address.
    assert_eq!(process.pte(va).unwrap().pfn, mxp_defs::pfn(RAM_BASE));
}
