// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A physical page-frame pool backing DMA bounce buffers.
//!
//! The pool manages ranges of host physical pages and hands out frames to
//! per-device allocators: scattered single frames for sparse bounce plans,
//! or physically contiguous runs under an address mask for double buffers.
//! Allocations are returned by dropping the handle.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use dma_command::memory::BounceAllocator;
use dma_command::memory::FrameBacking;
use dma_command::memory::FrameList;
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;

const PAGE_SIZE: u64 = 4096;
const PAGE_SHIFT: u32 = 12;

/// Errors returned on allocation methods.
#[derive(Debug, Error)]
pub enum Error {
    /// Not enough free frames in the pool.
    #[error("unable to allocate {size} pool pages with tag {tag}")]
    FramePoolOutOfMemory {
        /// The size in pages of the allocation.
        size: u64,
        /// The tag of the allocation.
        tag: String,
    },
    /// No contiguous free run satisfies the size and address limit.
    #[error("no contiguous run of {size} pages below pfn {limit:#x}")]
    NoContiguousRun {
        /// The size in pages of the allocation.
        size: u64,
        /// The highest acceptable page frame number.
        limit: u64,
    },
    /// The device name is already registered.
    #[error("device name {0} already in use")]
    DeviceInUse(String),
}

#[derive(Debug, PartialEq, Eq)]
struct Slot {
    base_pfn: u64,
    size_pages: u64,
    state: SlotState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SlotState {
    Free,
    Allocated {
        /// Index into the pool's device id table.
        device_id: usize,
        tag: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DeviceId {
    /// In use by an allocator.
    Used(String),
    /// Dropped; reusable by an allocator with the same name.
    Unassigned(String),
}

impl DeviceId {
    fn name(&self) -> &str {
        match self {
            DeviceId::Used(name) => name,
            DeviceId::Unassigned(name) => name,
        }
    }
}

struct PoolState {
    slots: Vec<Slot>,
    device_ids: Vec<DeviceId>,
}

struct PoolInner {
    state: Mutex<PoolState>,
}

/// A pool of physical page frames, created over explicit page ranges.
///
/// Frames are allocated via [`FramePoolAllocator`] from [`Self::allocator`].
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Returns a new pool managing the page frame ranges in `ranges`.
    pub fn new(ranges: &[Range<u64>]) -> Self {
        let slots = ranges
            .iter()
            .map(|range| Slot {
                base_pfn: range.start,
                size_pages: range.end - range.start,
                state: SlotState::Free,
            })
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    slots,
                    device_ids: Vec::new(),
                }),
            }),
        }
    }

    /// Creates an allocator instance for `device_name`. The name must be
    /// unique among live allocators; it tags allocations for diagnostics.
    pub fn allocator(&self, device_name: String) -> Result<FramePoolAllocator, Error> {
        FramePoolAllocator::new(&self.inner, device_name)
    }

    /// Total number of free pages across all ranges.
    pub fn free_pages(&self) -> u64 {
        self.inner
            .state
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.state == SlotState::Free)
            .map(|slot| slot.size_pages)
            .sum()
    }
}

/// A per-device frame allocator.
///
/// Dropping the allocator releases its name for reuse; outstanding handles
/// stay valid and free their frames when dropped.
pub struct FramePoolAllocator {
    inner: Arc<PoolInner>,
    device_id: usize,
}

impl FramePoolAllocator {
    fn new(inner: &Arc<PoolInner>, device_name: String) -> Result<Self, Error> {
        let device_id;
        {
            let mut state = inner.state.lock();
            let index = state
                .device_ids
                .iter()
                .position(|id| id.name() == device_name);
            match index {
                Some(index) => {
                    let entry = &mut state.device_ids[index];
                    match entry {
                        DeviceId::Unassigned(_) => {
                            *entry = DeviceId::Used(device_name);
                            device_id = index;
                        }
                        DeviceId::Used(_) => return Err(Error::DeviceInUse(device_name)),
                    }
                }
                None => {
                    state.device_ids.push(DeviceId::Used(device_name));
                    device_id = state.device_ids.len() - 1;
                }
            }
        }
        Ok(Self {
            inner: inner.clone(),
            device_id,
        })
    }

    /// Takes `pages` frames out of the free slot at `index`, committing an
    /// allocated slot and the free remainder back to the pool.
    fn commit(state: &mut PoolState, index: usize, pages: u64, device_id: usize, tag: &str) -> u64 {
        let slot = state.slots.swap_remove(index);
        assert!(matches!(slot.state, SlotState::Free));

        let base_pfn = slot.base_pfn;
        state.slots.push(Slot {
            base_pfn,
            size_pages: pages,
            state: SlotState::Allocated {
                device_id,
                tag: tag.to_string(),
            },
        });
        if slot.size_pages > pages {
            state.slots.push(Slot {
                base_pfn: slot.base_pfn + pages,
                size_pages: slot.size_pages - pages,
                state: SlotState::Free,
            });
        }
        base_pfn
    }

    fn release(state: &mut PoolState, base_pfn: u64, size_pages: u64) {
        let slot = state
            .slots
            .iter_mut()
            .find(|slot| {
                matches!(slot.state, SlotState::Allocated { .. })
                    && slot.base_pfn == base_pfn
                    && slot.size_pages == size_pages
            })
            .expect("must find allocation");
        slot.state = SlotState::Free;
    }

    /// Reserves `count` frames, not necessarily contiguous, with the given
    /// tag.
    pub fn alloc_frames(&self, count: u64, tag: String) -> Result<FramePoolHandle, Error> {
        assert_ne!(count, 0);
        let mut state = self.inner.state.lock();
        let mut remaining = count;
        let mut chunks = Vec::new();

        while remaining != 0 {
            let Some(index) = state
                .slots
                .iter()
                .position(|slot| slot.state == SlotState::Free)
            else {
                // Roll the partial reservation back before reporting.
                for &(base_pfn, size_pages) in &chunks {
                    Self::release(&mut state, base_pfn, size_pages);
                }
                return Err(Error::FramePoolOutOfMemory { size: count, tag });
            };
            let take = state.slots[index].size_pages.min(remaining);
            let base_pfn = Self::commit(&mut state, index, take, self.device_id, &tag);
            chunks.push((base_pfn, take));
            remaining -= take;
        }

        Ok(FramePoolHandle::new(self.inner.clone(), chunks))
    }

    /// Reserves a physically contiguous run of `count` frames, all at or
    /// below `limit` when one is given.
    pub fn alloc_contiguous(
        &self,
        count: u64,
        limit: Option<u64>,
        tag: String,
    ) -> Result<FramePoolHandle, Error> {
        assert_ne!(count, 0);
        let limit = limit.unwrap_or(u64::MAX);
        let mut state = self.inner.state.lock();
        let index = state
            .slots
            .iter()
            .position(|slot| {
                slot.state == SlotState::Free
                    && slot.size_pages >= count
                    && slot.base_pfn + count - 1 <= limit
            })
            .ok_or(Error::NoContiguousRun { size: count, limit })?;
        let base_pfn = Self::commit(&mut state, index, count, self.device_id, &tag);
        Ok(FramePoolHandle::new(
            self.inner.clone(),
            vec![(base_pfn, count)],
        ))
    }
}

impl Drop for FramePoolAllocator {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        let device_name = state.device_ids[self.device_id].name().to_string();
        let prev = std::mem::replace(
            &mut state.device_ids[self.device_id],
            DeviceId::Unassigned(device_name),
        );
        assert!(matches!(prev, DeviceId::Used(_)));
    }
}

/// A handle to reserved frames. Dropping it returns the frames to the pool.
#[derive(Debug)]
pub struct FramePoolHandle {
    inner: Arc<PoolInner>,
    /// The `(base_pfn, size_pages)` runs backing this reservation.
    chunks: Vec<(u64, u64)>,
    pfns: Vec<u64>,
}

impl FramePoolHandle {
    fn new(inner: Arc<PoolInner>, chunks: Vec<(u64, u64)>) -> Self {
        let pfns = chunks
            .iter()
            .flat_map(|&(base_pfn, size_pages)| base_pfn..base_pfn + size_pages)
            .collect();
        Self {
            inner,
            chunks,
            pfns,
        }
    }

    /// The reserved page frame numbers, in reservation order.
    pub fn pfns(&self) -> &[u64] {
        &self.pfns
    }

    /// The number of reserved frames.
    pub fn size_pages(&self) -> u64 {
        self.pfns.len() as u64
    }
}

impl std::fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolInner").finish_non_exhaustive()
    }
}

impl Drop for FramePoolHandle {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        for &(base_pfn, size_pages) in &self.chunks {
            FramePoolAllocator::release(&mut state, base_pfn, size_pages);
        }
    }
}

impl FrameBacking for FramePoolHandle {
    fn pfns(&self) -> &[u64] {
        &self.pfns
    }
}

impl BounceAllocator for FramePoolAllocator {
    fn alloc_frames(&self, count: u64) -> anyhow::Result<FrameList> {
        let handle = self.alloc_frames(count, "bounce frames".into())?;
        Ok(FrameList::new(handle))
    }

    fn alloc_contiguous(&self, bytes: u64, phys_mask: u64) -> anyhow::Result<FrameList> {
        let count = bytes.div_ceil(PAGE_SIZE);
        let limit = phys_mask >> PAGE_SHIFT;
        let handle = self.alloc_contiguous(count, Some(limit), "bounce buffer".into())?;
        tracing::debug!(
            base_pfn = handle.pfns()[0],
            pages = count,
            "contiguous bounce reservation"
        );
        Ok(FrameList::new(handle))
    }
}
