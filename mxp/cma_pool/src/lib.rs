// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A contiguous memory pool handing out physically contiguous, zeroed page
//! runs, standing in for the platform's CMA area behind the coherent DMA
//! allocator.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use anyhow::Context;
use dma_region::emulated::PhysicalMemory;
use dma_region::emulated::LINEAR_MAP_BASE;
use dma_region::host::AllocError;
use dma_region::host::CoherentAlloc;
use dma_region::host::CoherentAllocator;
use mxp_defs::PAGE_SIZE;
use mxp_defs::PAGE_SIZE64;
use parking_lot::Mutex;
use std::num::NonZeroU64;
use std::sync::Arc;
use thiserror::Error;

/// Error returned when unable to allocate memory.
#[derive(Debug, Error)]
#[error("unable to allocate {size_pages} pages below bus mask {mask:#x} with tag {tag}")]
pub struct CmaPoolOutOfMemory {
    size_pages: u64,
    mask: u64,
    tag: String,
}

/// Memory integrity error.
#[derive(Debug, Error)]
#[error("pool integrity error leaked blocks {leaked_blocks}")]
pub struct CmaPoolIntegrity {
    leaked_blocks: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum State {
    Free {
        base_pfn: u64,
        size_pages: u64,
    },
    Allocated {
        base_pfn: u64,
        size_pages: u64,
        tag: String,
    },
}

#[derive(Debug)]
struct CmaPoolInner {
    state: Vec<State>,
    fail_next: bool,
}

impl CmaPoolInner {
    /// Merges free chunks that touch, keeping the list sorted by pfn.
    fn coalesce(&mut self) {
        self.state.sort_by_key(|s| match s {
            State::Free { base_pfn, .. } | State::Allocated { base_pfn, .. } => *base_pfn,
        });
        let mut merged: Vec<State> = Vec::with_capacity(self.state.len());
        for state in self.state.drain(..) {
            if let (
                Some(State::Free {
                    base_pfn: prev_base,
                    size_pages: prev_len,
                }),
                State::Free {
                    base_pfn,
                    size_pages,
                },
            ) = (merged.last_mut(), &state)
            {
                if *prev_base + *prev_len == *base_pfn {
                    *prev_len += size_pages;
                    continue;
                }
            }
            merged.push(state);
        }
        self.state = merged;
    }
}

/// One live allocation, as reported by [`CmaPool::allocations`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmaPoolAllocation {
    /// First page frame.
    pub base_pfn: u64,
    /// Length in pages.
    pub size_pages: u64,
    /// Tag of the allocator that made it.
    pub tag: String,
}

/// A contiguous page pool over a range of physical memory.
///
/// Pages are allocated via [`CmaPoolAllocator`] from [`Self::allocator`].
pub struct CmaPool {
    inner: Arc<Mutex<CmaPoolInner>>,
    phys: PhysicalMemory,
    bus_offset: u64,
}

impl CmaPool {
    /// Creates a pool over `size` bytes of `phys` starting at `base`. The
    /// device sees each page at its physical address plus `bus_offset`.
    pub fn new(
        phys: PhysicalMemory,
        base: u64,
        size: u64,
        bus_offset: u64,
    ) -> anyhow::Result<Self> {
        if base % PAGE_SIZE64 != 0 || size % PAGE_SIZE64 != 0 || bus_offset % PAGE_SIZE64 != 0 {
            anyhow::bail!(
                "pool range {base:#x}+{size:#x} (bus offset {bus_offset:#x}) is not page aligned"
            );
        }
        if size == 0 {
            anyhow::bail!("pool of size 0 not supported");
        }
        // Touch the last byte so a pool outside physical memory fails here
        // rather than at first allocation.
        phys.read(base + size - 1, &mut [0])
            .context("pool range is not backed by physical memory")?;

        Ok(Self {
            inner: Arc::new(Mutex::new(CmaPoolInner {
                state: vec![State::Free {
                    base_pfn: base / PAGE_SIZE64,
                    size_pages: size / PAGE_SIZE64,
                }],
                fail_next: false,
            })),
            phys,
            bus_offset,
        })
    }

    /// Returns an allocator that tags its allocations with `tag`.
    pub fn allocator(&self, tag: &str) -> CmaPoolAllocator {
        CmaPoolAllocator {
            inner: self.inner.clone(),
            phys: self.phys.clone(),
            bus_offset: self.bus_offset,
            tag: tag.to_owned(),
        }
    }

    /// Makes the next allocation fail.
    pub fn fail_next_alloc(&self) {
        self.inner.lock().fail_next = true;
    }

    /// The number of live allocations.
    pub fn outstanding(&self) -> usize {
        self.inner
            .lock()
            .state
            .iter()
            .filter(|s| matches!(s, State::Allocated { .. }))
            .count()
    }

    /// Lists the live allocations in pfn order.
    pub fn allocations(&self) -> Vec<CmaPoolAllocation> {
        let mut allocs: Vec<_> = self
            .inner
            .lock()
            .state
            .iter()
            .filter_map(|s| match s {
                State::Allocated {
                    base_pfn,
                    size_pages,
                    tag,
                } => Some(CmaPoolAllocation {
                    base_pfn: *base_pfn,
                    size_pages: *size_pages,
                    tag: tag.clone(),
                }),
                State::Free { .. } => None,
            })
            .collect();
        allocs.sort_by_key(|a| a.base_pfn);
        allocs
    }

    /// Checks that every allocation has been returned.
    pub fn validate(&self) -> Result<(), CmaPoolIntegrity> {
        let leaked_blocks = self.outstanding();
        if leaked_blocks > 0 {
            return Err(CmaPoolIntegrity { leaked_blocks });
        }
        Ok(())
    }
}

/// A page allocator for the pool.
#[derive(Clone, Debug)]
pub struct CmaPoolAllocator {
    inner: Arc<Mutex<CmaPoolInner>>,
    phys: PhysicalMemory,
    bus_offset: u64,
    tag: String,
}

impl CmaPoolAllocator {
    /// Allocates `size_pages` contiguous pages whose bus addresses all fall
    /// within `mask`, returning the first pfn.
    pub fn alloc(&self, size_pages: NonZeroU64, mask: u64) -> Result<u64, CmaPoolOutOfMemory> {
        let mut inner = self.inner.lock();
        let size_pages = size_pages.get();
        let oom = || CmaPoolOutOfMemory {
            size_pages,
            mask,
            tag: self.tag.clone(),
        };

        if std::mem::take(&mut inner.fail_next) {
            return Err(oom());
        }

        let bus_pfn_offset = self.bus_offset / PAGE_SIZE64;
        let index = inner
            .state
            .iter()
            .position(|state| match state {
                State::Free {
                    base_pfn,
                    size_pages: len,
                } => {
                    let last_bus = (base_pfn + bus_pfn_offset + size_pages) * PAGE_SIZE64 - 1;
                    *len >= size_pages && last_bus & !mask == 0
                }
                State::Allocated { .. } => false,
            })
            .ok_or_else(oom)?;

        let base_pfn = match inner.state.swap_remove(index) {
            State::Free {
                base_pfn: base,
                size_pages: len,
            } => {
                inner.state.push(State::Allocated {
                    base_pfn: base,
                    size_pages,
                    tag: self.tag.clone(),
                });

                if len > size_pages {
                    inner.state.push(State::Free {
                        base_pfn: base + size_pages,
                        size_pages: len - size_pages,
                    });
                }

                base
            }
            State::Allocated { .. } => unreachable!(),
        };

        tracing::trace!(base_pfn, size_pages, tag = %self.tag, "pool alloc");
        Ok(base_pfn)
    }

    /// Returns pages previously returned by [`Self::alloc`].
    pub fn free(&self, base_pfn: u64, size_pages: u64) {
        let mut inner = self.inner.lock();
        let index = inner
            .state
            .iter()
            .position(|state| {
                if let State::Allocated {
                    base_pfn: base,
                    size_pages: len,
                    tag: _,
                } = state
                {
                    *base == base_pfn && *len == size_pages
                } else {
                    false
                }
            })
            .expect("must find allocation");

        inner.state[index] = State::Free {
            base_pfn,
            size_pages,
        };
        inner.coalesce();
        tracing::trace!(base_pfn, size_pages, tag = %self.tag, "pool free");
    }
}

impl CoherentAllocator for CmaPoolAllocator {
    fn alloc_coherent(&self, len: usize, mask: u64) -> Result<CoherentAlloc, AllocError> {
        let size_pages = NonZeroU64::new((len / PAGE_SIZE) as u64)
            .filter(|_| len % PAGE_SIZE == 0)
            .ok_or(AllocError { len })?;

        let base_pfn = self.alloc(size_pages, mask).map_err(|err| {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "coherent allocation failed"
            );
            AllocError { len }
        })?;

        let phys = base_pfn * PAGE_SIZE64;
        if let Err(err) = self.phys.fill(phys, len, 0) {
            self.free(base_pfn, size_pages.get());
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "pool page not backed"
            );
            return Err(AllocError { len });
        }

        Ok(CoherentAlloc::new(
            LINEAR_MAP_BASE + phys,
            phys + self.bus_offset,
            len,
        ))
    }

    fn free_coherent(&self, alloc: CoherentAlloc) {
        let phys = self.phys_addr(&alloc);
        assert_eq!(
            phys + self.bus_offset,
            alloc.bus_addr(),
            "cpu and bus address do not describe the same allocation"
        );
        self.free(phys / PAGE_SIZE64, (alloc.len() / PAGE_SIZE) as u64);
    }

    fn phys_addr(&self, alloc: &CoherentAlloc) -> u64 {
        alloc.cpu_addr() - LINEAR_MAP_BASE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    const BASE: u64 = 0x2000_0000;

    fn pool(pages: usize, bus_offset: u64) -> CmaPool {
        let phys = PhysicalMemory::new();
        phys.add_range("cma", BASE, pages * PAGE_SIZE);
        CmaPool::new(phys, BASE, (pages * PAGE_SIZE) as u64, bus_offset).unwrap()
    }

    #[test]
    fn alloc_and_free() {
        let pool = pool(16, 0);
        let alloc = pool.allocator("test");
        let a = alloc.alloc(NonZeroU64::new(4).unwrap(), u64::MAX).unwrap();
        let b = alloc.alloc(NonZeroU64::new(4).unwrap(), u64::MAX).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.outstanding(), 2);
        assert!(pool.validate().is_err());

        alloc.free(a, 4);
        alloc.free(b, 4);
        pool.validate().unwrap();

        // Freed chunks coalesce back into one run.
        let c = alloc.alloc(NonZeroU64::new(16).unwrap(), u64::MAX).unwrap();
        assert_eq!(c, BASE / PAGE_SIZE64);
    }

    #[test]
    fn out_of_memory() {
        let pool = pool(4, 0);
        let alloc = pool.allocator("test");
        alloc
            .alloc(NonZeroU64::new(5).unwrap(), u64::MAX)
            .unwrap_err();
        pool.fail_next_alloc();
        alloc
            .alloc(NonZeroU64::new(1).unwrap(), u64::MAX)
            .unwrap_err();
        alloc.alloc(NonZeroU64::new(1).unwrap(), u64::MAX).unwrap();
    }

    #[test]
    fn coherent_alloc_is_zeroed() {
        let pool = pool(4, 0x4000_0000);
        pool.phys.fill(BASE, 4 * PAGE_SIZE, 0xcc).unwrap();
        let alloc = pool.allocator("mxp0");

        let a = alloc
            .alloc_coherent(2 * PAGE_SIZE, mxp_defs::DMA_BIT_MASK_32)
            .unwrap();
        assert_eq!(a.bus_addr(), BASE + 0x4000_0000);
        assert_eq!(alloc.phys_addr(&a), BASE);

        let mut buf = vec![0xffu8; 2 * PAGE_SIZE];
        pool.phys.read(BASE, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        assert_eq!(
            pool.allocations(),
            [CmaPoolAllocation {
                base_pfn: BASE / PAGE_SIZE64,
                size_pages: 2,
                tag: "mxp0".into(),
            }]
        );
        alloc.free_coherent(a);
        pool.validate().unwrap();
    }

    #[test]
    fn coherent_alloc_respects_mask() {
        let pool = pool(4, 0xe000_0000);
        let alloc = pool.allocator("test");
        alloc
            .alloc_coherent(PAGE_SIZE, mxp_defs::dma_bit_mask(28))
            .unwrap_err();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "must find allocation")]
    fn double_free_panics() {
        let pool = pool(4, 0);
        let alloc = pool.allocator("test");
        let a = alloc.alloc(NonZeroU64::new(1).unwrap(), u64::MAX).unwrap();
        alloc.free(a, 1);
        alloc.free(a, 1);
    }

    #[test]
    fn pool_must_be_backed() {
        let phys = PhysicalMemory::new();
        phys.add_range("cma", BASE, PAGE_SIZE);
        assert!(CmaPool::new(phys.clone(), BASE, 2 * PAGE_SIZE64, 0).is_err());
        assert!(CmaPool::new(phys, BASE + 1, PAGE_SIZE64, 0).is_err());
    }
}
