// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Emulated collaborators: a sparse physical address space, a scatter-gather
//! memory descriptor, an IOMMU-like mapper and a bounce frame allocator,
//! all in-process. These back the engine's tests and any host that wants to
//! drive the engine without real hardware.

use crate::mapper::DmaMapper;
use crate::mapper::MapperDevice;
use crate::memory::BounceAllocator;
use crate::memory::CacheOp;
use crate::memory::Direction;
use crate::memory::DmaMemory;
use crate::memory::FrameBacking;
use crate::memory::FrameList;
use crate::memory::MapSpec;
use crate::memory::MapperAlloc;
use crate::memory::MemorySummary;
use crate::memory::PhysMemory;
use crate::memory::WalkOp;
use crate::memory::PAGE_MASK;
use crate::memory::PAGE_SHIFT;
use crate::memory::PAGE_SIZE;
use crate::DmaError;
use crate::Segment;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// A sparse emulated physical address space. Pages materialize zeroed on
/// first write; reads of untouched pages return zeroes.
#[derive(Default)]
pub struct EmulatedPhysMemory {
    pages: Mutex<BTreeMap<u64, Box<[u8; PAGE_SIZE as usize]>>>,
}

impl EmulatedPhysMemory {
    /// Creates an empty physical address space.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PhysMemory for EmulatedPhysMemory {
    fn read_phys(&self, mut addr: u64, dst: &mut [u8]) {
        let pages = self.pages.lock();
        let mut done = 0;
        while done < dst.len() {
            let in_page = (addr & PAGE_MASK) as usize;
            let chunk = (PAGE_SIZE as usize - in_page).min(dst.len() - done);
            match pages.get(&(addr >> PAGE_SHIFT)) {
                Some(page) => dst[done..done + chunk].copy_from_slice(&page[in_page..in_page + chunk]),
                None => dst[done..done + chunk].fill(0),
            }
            addr += chunk as u64;
            done += chunk;
        }
    }

    fn write_phys(&self, mut addr: u64, src: &[u8]) {
        let mut pages = self.pages.lock();
        let mut done = 0;
        while done < src.len() {
            let in_page = (addr & PAGE_MASK) as usize;
            let chunk = (PAGE_SIZE as usize - in_page).min(src.len() - done);
            let page = pages
                .entry(addr >> PAGE_SHIFT)
                .or_insert_with(|| Box::new([0; PAGE_SIZE as usize]));
            page[in_page..in_page + chunk].copy_from_slice(&src[done..done + chunk]);
            addr += chunk as u64;
            done += chunk;
        }
    }
}

/// A memory descriptor over an explicit list of physical runs.
pub struct EmulatedMemory {
    runs: Vec<Segment>,
    direction: Direction,
    phys: Arc<EmulatedPhysMemory>,
    system_mapper: Option<Arc<EmulatedMapper>>,
    active: AtomicI32,
    store_ops: AtomicU32,
    flush_ops: AtomicU32,
}

impl EmulatedMemory {
    /// Creates a descriptor covering `runs`, in order, over `phys`.
    pub fn new(phys: Arc<EmulatedPhysMemory>, runs: Vec<Segment>, direction: Direction) -> Self {
        assert!(runs.iter().all(|run| run.len != 0));
        Self {
            runs,
            direction,
            phys,
            system_mapper: None,
            active: AtomicI32::new(0),
            store_ops: AtomicU32::new(0),
            flush_ops: AtomicU32::new(0),
        }
    }

    /// Attaches the mapper this descriptor programs when asked for a
    /// mapping. Without one, mapping requests fail.
    pub fn with_system_mapper(mut self, mapper: Arc<EmulatedMapper>) -> Self {
        self.system_mapper = Some(mapper);
        self
    }

    /// Total length in bytes.
    pub fn len(&self) -> u64 {
        self.runs.iter().map(|run| run.len).sum()
    }

    /// Whether the descriptor is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The DMA-active count, incremented by attach and decremented by
    /// detach.
    pub fn active_count(&self) -> i32 {
        self.active.load(Ordering::Relaxed)
    }

    /// Number of cache store (pre-DMA) operations performed.
    pub fn store_ops(&self) -> u32 {
        self.store_ops.load(Ordering::Relaxed)
    }

    /// Number of cache flush (post-DMA) operations performed.
    pub fn flush_ops(&self) -> u32 {
        self.flush_ops.load(Ordering::Relaxed)
    }

    /// The physical address backing `offset`, for test assertions.
    pub fn phys_addr(&self, offset: u64) -> u64 {
        let (run, within) = self.locate(offset).expect("offset within the descriptor");
        run.addr + within
    }

    fn locate(&self, offset: u64) -> Option<(Segment, u64)> {
        let mut start = 0;
        for run in &self.runs {
            if offset < start + run.len {
                return Some((*run, offset - start));
            }
            start += run.len;
        }
        None
    }
}

impl DmaMemory for EmulatedMemory {
    fn characterize(&self, _mapped: bool) -> Result<MemorySummary, DmaError> {
        let highest_page = self
            .runs
            .iter()
            .map(|run| (run.addr + run.len - 1) >> PAGE_SHIFT)
            .max()
            .unwrap_or(0);
        let page_align = self.runs.iter().fold(0, |align, run| align | run.addr);
        Ok(MemorySummary {
            length: self.len(),
            direction: self.direction,
            highest_page,
            page_align: Some(page_align),
        })
    }

    fn walk(
        &self,
        _op: WalkOp,
        offset: u64,
        length: u64,
        _mapped: bool,
    ) -> Result<Option<Segment>, DmaError> {
        let Some((run, within)) = self.locate(offset) else {
            return Ok(None);
        };
        Ok(Some(Segment {
            addr: run.addr + within,
            len: (run.len - within).min(length),
        }))
    }

    fn dma_map(
        &self,
        _mapper: &dyn DmaMapper,
        device: Option<&dyn MapperDevice>,
        _spec: &MapSpec,
        offset: u64,
        length: u64,
    ) -> Result<MapperAlloc, DmaError> {
        let Some(mapper) = &self.system_mapper else {
            return Err(DmaError::Memory("descriptor has no mapping support".into()));
        };
        // Cover the descriptor from its start so the window base plus an
        // absolute offset lands on the right page.
        let pages = (offset + length + PAGE_MASK) >> PAGE_SHIFT;
        let base = mapper
            .alloc_window(pages)
            .ok_or(DmaError::Memory("mapper window exhausted".into()))?;
        for page in 0..pages {
            if let Some((run, within)) = self.locate(page << PAGE_SHIFT) {
                mapper.program(base + page, (run.addr + within) >> PAGE_SHIFT);
            }
        }
        tracing::debug!(
            base,
            pages,
            device = device.map(|device| device.name()),
            "programmed emulated mapping"
        );
        Ok(MapperAlloc {
            base: base << PAGE_SHIFT,
            pages,
        })
    }

    fn cache_op(&self, op: CacheOp, _offset: u64, _length: u64) {
        match op {
            CacheOp::Store => self.store_ops.fetch_add(1, Ordering::Relaxed),
            CacheOp::Flush => self.flush_ops.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn read_bytes(&self, offset: u64, dst: &mut [u8]) -> u64 {
        let mut done = 0;
        while done < dst.len() as u64 {
            let Some((run, within)) = self.locate(offset + done) else {
                break;
            };
            let chunk = (run.len - within).min(dst.len() as u64 - done) as usize;
            self.phys
                .read_phys(run.addr + within, &mut dst[done as usize..done as usize + chunk]);
            done += chunk as u64;
        }
        done
    }

    fn write_bytes(&self, offset: u64, src: &[u8]) -> u64 {
        let mut done = 0;
        while done < src.len() as u64 {
            let Some((run, within)) = self.locate(offset + done) else {
                break;
            };
            let chunk = (run.len - within).min(src.len() as u64 - done) as usize;
            self.phys
                .write_phys(run.addr + within, &src[done as usize..done as usize + chunk]);
            done += chunk as u64;
        }
        done
    }

    fn set_active(&self, active: bool) {
        self.active
            .fetch_add(if active { 1 } else { -1 }, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct MapperState {
    next_window: u64,
    windows: BTreeMap<u64, u64>,
    translations: BTreeMap<u64, u64>,
}

/// An emulated IOMMU: a bump allocator over an I/O virtual window space and
/// a page translation table.
pub struct EmulatedMapper {
    state: Mutex<MapperState>,
    bypass: Option<u64>,
}

/// First page frame number of the emulated I/O virtual space.
const WINDOW_BASE_PFN: u64 = 0x10_000;

impl EmulatedMapper {
    /// Creates a mapper with no bypass support.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MapperState {
                next_window: WINDOW_BASE_PFN,
                ..Default::default()
            }),
            bypass: None,
        }
    }

    /// Creates a mapper whose bypassed transfers carry `mask`.
    pub fn with_bypass_mask(mask: u64) -> Self {
        Self {
            bypass: Some(mask),
            ..Self::new()
        }
    }

    /// Inserts a translation from I/O virtual page to physical page.
    pub fn program(&self, iovm_pfn: u64, phys_pfn: u64) {
        self.state.lock().translations.insert(iovm_pfn, phys_pfn);
    }

    /// Number of windows currently reserved.
    pub fn outstanding_windows(&self) -> usize {
        self.state.lock().windows.len()
    }
}

impl Default for EmulatedMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaMapper for EmulatedMapper {
    fn alloc_window(&self, pages: u64) -> Option<u64> {
        if pages == 0 {
            return None;
        }
        let mut state = self.state.lock();
        let base = state.next_window;
        state.next_window += pages;
        state.windows.insert(base, pages);
        Some(base)
    }

    fn map_range(&self, base: u64, pages: u64) -> Option<u64> {
        let window = self.alloc_window(pages)?;
        for page in 0..pages {
            self.program(window + page, base + page);
        }
        Some(window)
    }

    fn free_window(&self, base: u64, pages: u64) {
        let mut state = self.state.lock();
        let reserved = state.windows.remove(&base);
        assert_eq!(reserved, Some(pages), "window free does not match reservation");
        for page in base..base + pages {
            state.translations.remove(&page);
        }
    }

    fn iovm_free(&self, base: u64, pages: u64) {
        self.free_window(base, pages);
    }

    fn map_addr(&self, addr: u64) -> u64 {
        let state = self.state.lock();
        match state.translations.get(&(addr >> PAGE_SHIFT)) {
            Some(&phys_pfn) => (phys_pfn << PAGE_SHIFT) | (addr & PAGE_MASK),
            None => addr,
        }
    }

    fn bypass_mask(&self) -> Option<u64> {
        self.bypass
    }
}

#[derive(Default)]
struct FrameAllocState {
    next_pfn: u64,
    outstanding: u64,
}

struct FrameAllocInner {
    state: Mutex<FrameAllocState>,
    fail_frames: AtomicBool,
    fail_contiguous: AtomicBool,
}

/// An emulated bounce frame allocator handing out frames from a low region
/// of the emulated physical space, with outstanding-allocation accounting
/// and injectable failures.
pub struct EmulatedFrameAllocator {
    inner: Arc<FrameAllocInner>,
}

/// First page frame number handed out by [`EmulatedFrameAllocator`].
const FRAME_BASE_PFN: u64 = 0x2000;

impl EmulatedFrameAllocator {
    /// Creates an allocator over the low emulated frame region.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FrameAllocInner {
                state: Mutex::new(FrameAllocState {
                    next_pfn: FRAME_BASE_PFN,
                    outstanding: 0,
                }),
                fail_frames: false.into(),
                fail_contiguous: false.into(),
            }),
        }
    }

    /// Number of frames reserved and not yet released.
    pub fn outstanding(&self) -> u64 {
        self.inner.state.lock().outstanding
    }

    /// Makes [`BounceAllocator::alloc_frames`] fail until cleared.
    pub fn fail_frames(&self, fail: bool) {
        self.inner.fail_frames.store(fail, Ordering::Relaxed);
    }

    /// Makes [`BounceAllocator::alloc_contiguous`] fail until cleared.
    pub fn fail_contiguous(&self, fail: bool) {
        self.inner.fail_contiguous.store(fail, Ordering::Relaxed);
    }

    fn take(&self, count: u64) -> Vec<u64> {
        let mut state = self.inner.state.lock();
        let base = state.next_pfn;
        state.next_pfn += count;
        state.outstanding += count;
        (base..base + count).collect()
    }
}

impl Default for EmulatedFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

struct EmulatedFrames {
    pfns: Vec<u64>,
    inner: Arc<FrameAllocInner>,
}

impl FrameBacking for EmulatedFrames {
    fn pfns(&self) -> &[u64] {
        &self.pfns
    }
}

impl Drop for EmulatedFrames {
    fn drop(&mut self) {
        self.inner.state.lock().outstanding -= self.pfns.len() as u64;
    }
}

impl BounceAllocator for EmulatedFrameAllocator {
    fn alloc_frames(&self, count: u64) -> anyhow::Result<FrameList> {
        if self.inner.fail_frames.load(Ordering::Relaxed) {
            anyhow::bail!("frame allocation disabled");
        }
        anyhow::ensure!(count != 0, "empty frame allocation");
        Ok(FrameList::new(EmulatedFrames {
            pfns: self.take(count),
            inner: self.inner.clone(),
        }))
    }

    fn alloc_contiguous(&self, bytes: u64, phys_mask: u64) -> anyhow::Result<FrameList> {
        if self.inner.fail_contiguous.load(Ordering::Relaxed) {
            anyhow::bail!("contiguous allocation disabled");
        }
        let count = (bytes + PAGE_MASK) >> PAGE_SHIFT;
        anyhow::ensure!(count != 0, "empty contiguous allocation");
        let pfns = self.take(count);
        let base = pfns[0] << PAGE_SHIFT;
        anyhow::ensure!(
            (base & !phys_mask) == 0,
            "contiguous allocation does not satisfy the physical mask"
        );
        Ok(FrameList::new(EmulatedFrames {
            pfns,
            inner: self.inner.clone(),
        }))
    }
}

/// A named device identity.
pub struct EmulatedDevice {
    name: String,
}

impl EmulatedDevice {
    /// Creates a device identity with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl MapperDevice for EmulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }
}
