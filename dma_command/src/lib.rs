// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A DMA command engine: prepares a described region of host memory for a
//! bus-master device, producing device-visible (address, length) segments
//! that satisfy the device's addressing width, segment size, alignment and
//! transfer size constraints. When the memory is unreachable or misaligned
//! for the device, the engine transparently interposes a bounce buffer and
//! moves bytes in either direction around the transfer.
//!
//! The engine consumes narrow contracts for everything outside its core
//! job: the described memory ([`DmaMemory`]), an optional IOMMU-like mapper
//! ([`DmaMapper`]), host physical memory access ([`PhysMemory`]) and bounce
//! allocation ([`BounceAllocator`]). The [`emulated`] module provides
//! in-process implementations of all of them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod bounce;
pub mod emulated;
pub mod encode;
mod gen;
pub mod mapper;
pub mod memory;
#[cfg(test)]
mod tests;

pub use encode::SegmentFormat;

use bounce::BounceBuffer;
use bounce::BouncePlan;
use bounce::WalkOps;
use gen::generate;
use gen::ClientVisitor;
use gen::GenParams;
use gen::PieceSource;
use gen::RemapLookup;
use gen::TransferBuf;
use gen::TransferVisitor;
use gen::Walker;
use mapper::DmaMapper;
use mapper::MapperDevice;
use memory::BounceAllocator;
use memory::CacheOp;
use memory::DmaMemory;
use memory::Direction;
use memory::MapSpec;
use memory::MemorySummary;
use memory::PhysMemory;
use memory::PAGE_MASK;
use memory::PAGE_SHIFT;
use std::sync::Arc;
use thiserror::Error;

/// One device-visible (address, length) pair.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Segment {
    /// Device-visible address.
    pub addr: u64,
    /// Length in bytes.
    pub len: u64,
}

/// Errors produced by the command engine.
#[derive(Debug, Error)]
pub enum DmaError {
    /// Invalid configuration, parameter, or bidirectional synchronize.
    #[error("invalid configuration or argument")]
    InvalidArgument,
    /// The attached memory cannot be replaced while prepared.
    #[error("memory cannot be replaced while the command is active")]
    Busy,
    /// No memory attached, nested prepare mismatch, or command inactive.
    #[error("command is not ready for this operation")]
    NotReady,
    /// The operation requires the command to be idle.
    #[error("operation not permitted while the command is active")]
    NotPermitted,
    /// The requested length exceeds the maximum transfer size.
    #[error("transfer length exceeds the maximum transfer size")]
    NoSpace,
    /// Bounce or mapper resources could not be reserved.
    #[error("failed to reserve bounce or mapper resources")]
    NoResources,
    /// The source memory does not satisfy the alignment constraint.
    #[error("source memory does not satisfy the alignment constraint")]
    NotAligned,
    /// A segment cannot satisfy the device address width or the output
    /// record format.
    #[error("segment does not fit the device address width or record format")]
    TooLarge,
    /// The offset is past the end of the prepared range.
    #[error("offset is past the end of the prepared range")]
    Overrun,
    /// A bounce copy moved fewer bytes than requested.
    #[error("bounce copy transferred fewer bytes than requested")]
    Underrun,
    /// A collaborator failed; the source error is preserved.
    #[error("memory descriptor failure")]
    Memory(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// How emitted addresses relate to the mapper.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum MappingMode {
    /// Addresses are translated by the mapper when one is interposed.
    #[default]
    Mapped,
    /// Addresses bypass the mapper; the mapper's bypass mask is OR'd into
    /// every emitted address.
    Bypassed,
    /// Memory is not cache coherent with the device; the engine issues
    /// cache maintenance around prepare and complete.
    NonCoherent,
}

/// Mapping mode plus orthogonal flags.
#[derive(Debug, Copy, Clone, Default)]
pub struct MappingOptions {
    /// The mapping mode.
    pub mode: MappingMode,
    /// Assert that the source memory already satisfies the device's
    /// constraints: skip bounce planning and refuse to copy.
    pub iterate_only: bool,
}

/// Device constraints for a command, immutable once the command exists.
#[derive(Debug, Copy, Clone)]
pub struct CommandSpecification {
    /// Output record format for generated segments.
    pub format: SegmentFormat,
    /// Number of device address bits, or 0 for no cap. 32-bit formats force
    /// a cap of at most 32.
    pub num_address_bits: u32,
    /// Largest single segment in bytes; 0 means no cap.
    pub max_segment_size: u64,
    /// Largest prepared transfer in bytes; 0 means no cap.
    pub max_transfer_size: u64,
    /// Required segment address alignment in bytes, a power of two; 0 is
    /// treated as 1.
    pub alignment: u64,
    /// Mapping mode and flags.
    pub options: MappingOptions,
}

#[derive(Debug, Copy, Clone)]
struct ResolvedSpec {
    format: SegmentFormat,
    num_address_bits: u32,
    max_segment_size: u64,
    max_transfer_size: u64,
    align_mask: u64,
    mode: MappingMode,
    iterate_only: bool,
}

fn resolve(spec: &CommandSpecification) -> Result<ResolvedSpec, DmaError> {
    let mut bits = spec.num_address_bits;
    if spec.format.is_32_bit() {
        if bits == 0 {
            bits = 32;
        } else if bits > 32 {
            return Err(DmaError::InvalidArgument);
        }
    }
    if bits != 0 && !(PAGE_SHIFT..=64).contains(&bits) {
        return Err(DmaError::InvalidArgument);
    }
    let alignment = if spec.alignment == 0 { 1 } else { spec.alignment };
    if !alignment.is_power_of_two() {
        return Err(DmaError::InvalidArgument);
    }
    Ok(ResolvedSpec {
        format: spec.format,
        num_address_bits: bits,
        max_segment_size: if spec.max_segment_size == 0 {
            u64::MAX
        } else {
            spec.max_segment_size
        },
        max_transfer_size: if spec.max_transfer_size == 0 {
            u64::MAX
        } else {
            spec.max_transfer_size
        },
        align_mask: alignment - 1,
        mode: spec.options.mode,
        iterate_only: spec.options.iterate_only,
    })
}

/// Aggregates the ambient collaborators commands need and spawns commands.
pub struct DmaManager {
    phys: Arc<dyn PhysMemory>,
    bounce: Arc<dyn BounceAllocator>,
    system_mapper: Option<Arc<dyn DmaMapper>>,
}

impl DmaManager {
    /// Creates a manager over the given physical memory access, bounce
    /// allocator, and optional system-wide mapper.
    pub fn new(
        phys: Arc<dyn PhysMemory>,
        bounce: Arc<dyn BounceAllocator>,
        system_mapper: Option<Arc<dyn DmaMapper>>,
    ) -> Self {
        Self {
            phys,
            bounce,
            system_mapper,
        }
    }

    /// Creates a command for a device with the given constraints.
    ///
    /// A command with no mapper of its own uses the system mapper, if any.
    pub fn new_command(
        &self,
        spec: &CommandSpecification,
        mapper: Option<Arc<dyn DmaMapper>>,
        device: Option<Arc<dyn MapperDevice>>,
    ) -> Result<DmaCommand, DmaError> {
        let spec = resolve(spec)?;
        let (mapper, mapper_is_system) = match mapper {
            Some(mapper) => {
                let is_system = self
                    .system_mapper
                    .as_ref()
                    .is_some_and(|system| Arc::ptr_eq(system, &mapper));
                (Some(mapper), is_system)
            }
            None => (self.system_mapper.clone(), true),
        };
        let bypass_mask = if spec.mode == MappingMode::Bypassed {
            match &mapper {
                Some(mapper) => mapper.bypass_mask().ok_or(DmaError::InvalidArgument)?,
                None => 0,
            }
        } else {
            0
        };
        Ok(DmaCommand {
            spec,
            bypass_mask,
            mapper,
            mapper_is_system,
            device,
            system_mapper: self.system_mapper.clone(),
            phys: self.phys.clone(),
            bounce_alloc: self.bounce.clone(),
            memory: None,
            summary: MemorySummary::default(),
            check_addressing: false,
            active: 0,
            state: TransferState::default(),
        })
    }
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct MapperWindow {
    /// Base device address of the window.
    pub base: u64,
    pub pages: u64,
    /// Reserved directly from the mapper for this command, as opposed to
    /// recorded by the descriptor's mapping.
    pub local: bool,
}

/// Per-prepare state, valid while `active > 0`.
#[derive(Debug, Default)]
pub(crate) struct TransferState {
    pub prepared_offset: u64,
    pub prepared_length: u64,
    /// The source memory already satisfies the device constraints; never
    /// bounce, fail instead.
    pub cursor: bool,
    pub misaligned: bool,
    pub double_buffer: bool,
    /// Segments can be synthesized from a contiguous mapper window.
    pub map_contig: bool,
    /// First walk since the memory descriptor was attached.
    pub new_md: bool,
    /// Effective alignment to enforce, reduced to in-page bits when a
    /// mapper is interposed.
    pub source_align_mask: u64,
    pub window: Option<MapperWindow>,
    pub walker: Walker,
    pub bounce: BouncePlan,
}

/// Picks where the generator obtains physical pieces from, in priority
/// order: a contiguous mapper window, the contiguous bounce buffer, then
/// the descriptor itself.
pub(crate) fn select_source<'a>(
    state: &TransferState,
    mem: &'a Arc<dyn DmaMemory>,
    mapped: bool,
) -> PieceSource<'a> {
    if state.map_contig {
        if let Some(window) = &state.window {
            return PieceSource::Window { base: window.base };
        }
    }
    if let Some(BounceBuffer::Contiguous { device_base, .. }) = &state.bounce.buffer {
        return PieceSource::Bounce { base: *device_base };
    }
    PieceSource::Memory {
        mem: &**mem,
        mapped,
    }
}

/// A DMA command: one device transfer constraint set, an attached memory
/// descriptor, and the prepare/generate/synchronize/complete lifecycle.
///
/// All operations are single-writer; the command has no internal locking.
pub struct DmaCommand {
    spec: ResolvedSpec,
    bypass_mask: u64,
    mapper: Option<Arc<dyn DmaMapper>>,
    mapper_is_system: bool,
    device: Option<Arc<dyn MapperDevice>>,
    system_mapper: Option<Arc<dyn DmaMapper>>,
    phys: Arc<dyn PhysMemory>,
    bounce_alloc: Arc<dyn BounceAllocator>,
    memory: Option<Arc<dyn DmaMemory>>,
    summary: MemorySummary,
    check_addressing: bool,
    /// Prepare refcount.
    active: u32,
    state: TransferState,
}

impl DmaCommand {
    /// Attaches (or with `None`, detaches) a memory descriptor.
    ///
    /// Attaching the already-attached descriptor without `auto_prepare`
    /// completes out any nested prepares and otherwise changes nothing.
    /// Replacing the descriptor while prepared fails with [`DmaError::Busy`].
    pub fn set_memory(
        &mut self,
        memory: Option<Arc<dyn DmaMemory>>,
        auto_prepare: bool,
    ) -> Result<(), DmaError> {
        let Some(md) = memory else {
            return self.clear_memory(false);
        };
        if let Some(current) = &self.memory {
            if Arc::ptr_eq(current, &md) {
                if !auto_prepare {
                    while self.active > 0 {
                        self.complete(false, false)?;
                    }
                }
                return Ok(());
            }
            if self.active > 0 {
                return Err(DmaError::Busy);
            }
            self.clear_memory(false)?;
        }

        let summary = md.characterize(self.spec.mode == MappingMode::Mapped)?;
        self.check_addressing = if self.spec.mode == MappingMode::Mapped && self.mapper.is_some() {
            false
        } else if self.spec.num_address_bits == 0 {
            false
        } else if summary.highest_page == 0 {
            // Unknown highest page; assume it may exceed the cap.
            true
        } else {
            summary.highest_page >= 1u64 << (self.spec.num_address_bits - PAGE_SHIFT)
        };
        self.summary = summary;
        self.state.new_md = true;
        md.set_active(true);
        self.memory = Some(md);

        if auto_prepare {
            if let Err(err) = self.prepare(0, 0, false, false) {
                self.clear_memory(true).ok();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Detaches the memory descriptor, first completing nested prepares when
    /// `auto_complete` is set and failing with [`DmaError::NotReady`]
    /// otherwise.
    pub fn clear_memory(&mut self, auto_complete: bool) -> Result<(), DmaError> {
        if self.active > 0 && !auto_complete {
            return Err(DmaError::NotReady);
        }
        while self.active > 0 && self.memory.is_some() {
            self.complete(false, false)?;
        }
        if let Some(md) = self.memory.take() {
            md.set_active(false);
            self.summary = MemorySummary::default();
        }
        Ok(())
    }

    /// The attached memory descriptor, if any.
    pub fn memory(&self) -> Option<&Arc<dyn DmaMemory>> {
        self.memory.as_ref()
    }

    /// The number of device address bits, or 0 for no cap.
    pub fn num_address_bits(&self) -> u32 {
        self.spec.num_address_bits
    }

    /// The required segment alignment in bytes.
    pub fn alignment(&self) -> u64 {
        self.spec.align_mask + 1
    }

    /// The prepared offset and length. Fails when not prepared.
    pub fn prepared_range(&self) -> Result<(u64, u64), DmaError> {
        if self.active == 0 {
            return Err(DmaError::NotReady);
        }
        Ok((self.state.prepared_offset, self.state.prepared_length))
    }

    /// Returns a new command with this command's configuration and no
    /// memory attached.
    pub fn clone_command(&self) -> DmaCommand {
        DmaCommand {
            spec: self.spec,
            bypass_mask: self.bypass_mask,
            mapper: self.mapper.clone(),
            mapper_is_system: self.mapper_is_system,
            device: self.device.clone(),
            system_mapper: self.system_mapper.clone(),
            phys: self.phys.clone(),
            bounce_alloc: self.bounce_alloc.clone(),
            memory: None,
            summary: MemorySummary::default(),
            check_addressing: false,
            active: 0,
            state: TransferState::default(),
        }
    }

    /// Replaces the command's constraints and prepares in one step.
    ///
    /// Fails with [`DmaError::NotPermitted`] while prepared. The mapper is
    /// only swapped when the handle actually changes, so passing the
    /// current mapper again is safe without an extra reference.
    pub fn prepare_with_specification(
        &mut self,
        spec: &CommandSpecification,
        mapper: Option<Arc<dyn DmaMapper>>,
        device: Option<Arc<dyn MapperDevice>>,
        offset: u64,
        length: u64,
        flush_cache: bool,
        synchronize: bool,
    ) -> Result<(), DmaError> {
        if self.active > 0 {
            return Err(DmaError::NotPermitted);
        }
        let resolved = resolve(spec)?;
        let (new_mapper, mapper_is_system) = match mapper {
            Some(mapper) => {
                let is_system = self
                    .system_mapper
                    .as_ref()
                    .is_some_and(|system| Arc::ptr_eq(system, &mapper));
                (Some(mapper), is_system)
            }
            None => (self.system_mapper.clone(), true),
        };
        let bypass_mask = if resolved.mode == MappingMode::Bypassed {
            match &new_mapper {
                Some(mapper) => mapper.bypass_mask().ok_or(DmaError::InvalidArgument)?,
                None => 0,
            }
        } else {
            0
        };

        let same = match (&self.mapper, &new_mapper) {
            (Some(current), Some(new)) => Arc::ptr_eq(current, new),
            (None, None) => true,
            _ => false,
        };
        if !same {
            self.mapper = new_mapper;
        }
        self.mapper_is_system = mapper_is_system;
        if device.is_some() {
            self.device = device;
        }
        self.spec = resolved;
        self.bypass_mask = bypass_mask;

        self.prepare(offset, length, flush_cache, synchronize)
    }

    /// Prepares `[offset, offset + length)` for DMA, planning and
    /// populating bounce resources and reserving a mapper window as the
    /// configuration requires. `length` of 0 means the whole memory.
    ///
    /// Prepares nest: each successful call must be paired with a
    /// [`Self::complete`], and nested calls must pass the same range.
    pub fn prepare(
        &mut self,
        offset: u64,
        length: u64,
        flush_cache: bool,
        synchronize: bool,
    ) -> Result<(), DmaError> {
        let Some(md) = self.memory.clone() else {
            return Err(DmaError::NotReady);
        };
        let length = if length == 0 {
            self.summary.length
        } else {
            length
        };
        if length > self.spec.max_transfer_size {
            return Err(DmaError::NoSpace);
        }
        if self.spec.mode == MappingMode::NonCoherent && flush_cache {
            md.cache_op(CacheOp::Store, offset, length);
        }

        if self.active > 0 {
            if self.state.prepared_offset != offset || self.state.prepared_length != length {
                return Err(DmaError::NotReady);
            }
            self.active += 1;
            return Ok(());
        }

        let state = &mut self.state;
        state.prepared_offset = offset;
        state.prepared_length = length;
        state.map_contig = false;
        state.misaligned = false;
        state.double_buffer = false;
        state.window = None;
        state.bounce = BouncePlan::default();
        state.source_align_mask = self.spec.align_mask;
        if self.mapper.is_some() {
            state.source_align_mask &= PAGE_MASK;
        }
        state.cursor = self.spec.iterate_only
            || (!self.check_addressing
                && (state.source_align_mask == 0
                    || self
                        .summary
                        .page_align
                        .is_some_and(|align| align & state.source_align_mask == 0)));

        let mut result = Ok(());
        if !self.state.cursor {
            let op = WalkOps {
                prepare: true,
                preflight: true,
                sync_out: synchronize,
                ..Default::default()
            };
            if let Err(err) = self.walk_all(op) {
                if matches!(err, DmaError::Underrun) {
                    // A short bounce copy keeps the prepare and its
                    // resources; the error is reported once the prepare is
                    // in place, and the caller completes as usual.
                    result = Err(err);
                } else {
                    self.rollback_prepare();
                    return Err(err);
                }
            }
        }

        if let Some(mapper) = self.mapper.clone() {
            if !self.mapper_is_system {
                let state = &self.state;
                let page_slop =
                    (state.prepared_offset + self.summary.page_align.unwrap_or(0)) & PAGE_MASK;
                let pages = (state.prepared_length + page_slop + PAGE_MASK) >> PAGE_SHIFT;
                match mapper.alloc_window(pages) {
                    Some(base_pfn) => {
                        self.state.window = Some(MapperWindow {
                            base: base_pfn << PAGE_SHIFT,
                            pages,
                            local: true,
                        });
                        self.state.map_contig = true;
                    }
                    None => {
                        tracing::warn!(pages, "mapper window reservation failed");
                        self.rollback_prepare();
                        return Err(DmaError::NoResources);
                    }
                }
            } else if let Some(BounceBuffer::Contiguous { host_base, .. }) =
                &self.state.bounce.buffer
            {
                // The device consumes the bounce, not the source memory, so
                // the bounce run is what gets mapped.
                let host_base = *host_base;
                let pages = (self.state.prepared_length + PAGE_MASK) >> PAGE_SHIFT;
                match mapper.map_range(host_base >> PAGE_SHIFT, pages) {
                    Some(base_pfn) => {
                        let device = base_pfn << PAGE_SHIFT;
                        if let Some(BounceBuffer::Contiguous { device_base, .. }) =
                            &mut self.state.bounce.buffer
                        {
                            *device_base = device;
                        }
                        self.state.window = Some(MapperWindow {
                            base: device,
                            pages,
                            local: true,
                        });
                    }
                    None => {
                        // Mapping is best effort under the system mapper.
                        tracing::warn!(pages, "bounce mapping failed, continuing unmapped");
                    }
                }
            } else {
                let map_spec = MapSpec {
                    alignment: self.spec.align_mask + 1,
                    num_address_bits: if self.spec.num_address_bits == 0 {
                        64
                    } else {
                        self.spec.num_address_bits
                    },
                };
                match md.dma_map(&*mapper, self.device.as_deref(), &map_spec, offset, length) {
                    Ok(alloc) => {
                        self.state.window = Some(MapperWindow {
                            base: alloc.base,
                            pages: alloc.pages,
                            local: false,
                        });
                        self.state.map_contig = true;
                    }
                    Err(err) => {
                        // Mapping is best effort under the system mapper.
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            "system mapping failed, continuing unmapped"
                        );
                    }
                }
            }
        }

        self.active = 1;
        result
    }

    fn rollback_prepare(&mut self) {
        let _ = self.walk_all(WalkOps {
            complete: true,
            ..Default::default()
        });
        self.release_window();
    }

    fn release_window(&mut self) {
        if let Some(window) = self.state.window.take() {
            if let Some(mapper) = &self.mapper {
                if window.local {
                    mapper.free_window(window.base >> PAGE_SHIFT, window.pages);
                } else if window.pages != 0 {
                    mapper.iovm_free(window.base >> PAGE_SHIFT, window.pages);
                }
            }
        }
        self.state.map_contig = false;
    }

    /// Completes one prepare. On the last nested complete, releases bounce
    /// and mapper resources, optionally copying bounced bytes back first.
    pub fn complete(&mut self, invalidate_cache: bool, synchronize: bool) -> Result<(), DmaError> {
        if self.active == 0 {
            return Err(DmaError::NotReady);
        }
        self.active -= 1;
        if self.active != 0 {
            return Ok(());
        }

        let mut result = Ok(());
        if !self.state.cursor {
            let op = WalkOps {
                complete: true,
                sync_in: synchronize,
                ..Default::default()
            };
            result = self.walk_all(op);
        }
        self.release_window();

        if self.spec.mode == MappingMode::NonCoherent && invalidate_cache {
            if let Some(md) = &self.memory {
                md.cache_op(
                    CacheOp::Flush,
                    self.state.prepared_offset,
                    self.state.prepared_length,
                );
            }
        }
        result
    }

    /// Moves bytes between the source memory and the bounce buffer.
    ///
    /// `direction` selects which way ([`Direction::InOut`] is rejected;
    /// [`Direction::None`] moves nothing but still applies
    /// `force_double_buffer`). With `force_double_buffer`, the command
    /// abandons any cursor or sparse bounce plan and re-plans with a full
    /// double buffer, after which emission satisfies the device constraints
    /// for any source memory.
    pub fn synchronize(
        &mut self,
        direction: Direction,
        force_double_buffer: bool,
    ) -> Result<(), DmaError> {
        if direction == Direction::InOut {
            return Err(DmaError::InvalidArgument);
        }
        if self.active == 0 {
            return Err(DmaError::NotReady);
        }

        let mut op = WalkOps::default();
        if force_double_buffer {
            if self.state.double_buffer {
                return Ok(());
            }
            if self.state.cursor {
                self.state.cursor = false;
            } else {
                self.walk_all(WalkOps {
                    complete: true,
                    ..Default::default()
                })?;
            }
            op.prepare = true;
            op.preflight = true;
            op.double_buffer = true;
        } else if self.state.cursor {
            return Ok(());
        }

        match direction {
            Direction::In => {
                op.sync_in = true;
                op.sync_always = true;
            }
            Direction::Out => {
                op.sync_out = true;
                op.sync_always = true;
            }
            _ => {}
        }

        self.walk_all(op)
    }

    fn walk_mapped(&self) -> bool {
        self.spec.mode != MappingMode::Bypassed && self.mapper.is_some()
    }

    /// Resets the walker when generation restarts, jumps, or the memory
    /// descriptor changed since the last walk.
    pub(crate) fn maybe_reset_walker(&mut self, abs_offset: u64) {
        let state = &mut self.state;
        if abs_offset == state.prepared_offset
            || abs_offset != state.walker.offset
            || state.new_md
        {
            state.walker.reset();
            state.new_md = false;
            state.bounce.next_remap = 0;
        }
    }

    /// Generates device-visible segments into `out` using the configured
    /// output format.
    ///
    /// `*offset` is relative to the prepared range and is advanced past the
    /// bytes the emitted segments cover; `*num_segments` holds the capacity
    /// on input and the number of records produced on output. Generation
    /// resumes across calls while `*offset` is left alone, and restarts
    /// when it is moved. On an operational error, `*num_segments` and
    /// `*offset` describe the records successfully emitted.
    pub fn gen_segments(
        &mut self,
        offset: &mut u64,
        out: &mut [u8],
        num_segments: &mut u32,
    ) -> Result<(), DmaError> {
        if self.active == 0 {
            return Err(DmaError::NotReady);
        }
        let capacity = *num_segments;
        if capacity == 0 || out.len() < capacity as usize * self.spec.format.record_size() {
            return Err(DmaError::InvalidArgument);
        }
        let Some(mem) = self.memory.clone() else {
            return Err(DmaError::NotReady);
        };

        let prepared_offset = self.state.prepared_offset;
        let mem_length = prepared_offset + self.state.prepared_length;
        let mut abs = prepared_offset + *offset;
        if abs >= mem_length {
            *num_segments = 0;
            return Err(DmaError::Overrun);
        }
        self.maybe_reset_walker(abs);

        let enforce_bits = self.state.window.is_some() || self.mapper.is_none();
        let source = select_source(&self.state, &mem, self.walk_mapped());
        let params = GenParams {
            source,
            prepared_offset,
            mem_length,
            bypass_mask: self.bypass_mask,
            max_phys: self.max_phys(),
            max_segment: self.spec.max_segment_size,
            source_align_mask: self.state.source_align_mask,
            client: true,
            cursor: self.state.cursor,
        };
        let mut visitor = ClientVisitor {
            format: self.spec.format,
            out,
            num_address_bits: self.spec.num_address_bits,
            enforce_bits,
        };

        let state = &mut self.state;
        let BouncePlan {
            buffer, next_remap, ..
        } = &mut state.bounce;
        let remap = match buffer {
            Some(BounceBuffer::Frames { frames, .. }) => Some(RemapLookup {
                frames,
                next: next_remap,
            }),
            _ => None,
        };

        let mut emitted = 0;
        let result = generate(
            &params,
            &mut state.walker,
            remap,
            &mut visitor,
            &mut abs,
            &mut emitted,
            capacity,
        );
        *num_segments = emitted;
        *offset = abs - prepared_offset;
        result
    }

    fn max_phys(&self) -> u64 {
        let bits = self.spec.num_address_bits;
        if bits != 0 && bits < 64 {
            (1u64 << bits) - 1
        } else {
            u64::MAX
        }
    }

    /// Copies up to `dst.len()` bytes out of the prepared range starting at
    /// `offset`, returning the number of bytes copied.
    pub fn read_bytes(&mut self, offset: u64, dst: &mut [u8]) -> u64 {
        self.transfer(offset, TransferBuf::Read(dst))
    }

    /// Copies `src` into the prepared range starting at `offset`, returning
    /// the number of bytes copied.
    pub fn write_bytes(&mut self, offset: u64, src: &[u8]) -> u64 {
        self.transfer(offset, TransferBuf::Write(src))
    }

    fn transfer(&mut self, offset: u64, buf: TransferBuf<'_>) -> u64 {
        let buf_len = match &buf {
            TransferBuf::Read(dst) => dst.len() as u64,
            TransferBuf::Write(src) => src.len() as u64,
        };
        if self.active == 0 || offset >= self.state.prepared_length {
            return 0;
        }
        let Some(mem) = self.memory.clone() else {
            return 0;
        };
        let length = buf_len.min(self.state.prepared_length - offset);
        let phys = self.phys.clone();
        let mapper = self.mapper.clone();
        let translate = if self.spec.mode == MappingMode::Mapped {
            mapper.as_deref()
        } else {
            None
        };

        let prepared_offset = self.state.prepared_offset;
        let mut abs = prepared_offset + offset;
        self.maybe_reset_walker(abs);

        let source = select_source(&self.state, &mem, self.walk_mapped());
        let params = GenParams {
            source,
            prepared_offset,
            mem_length: prepared_offset + self.state.prepared_length,
            bypass_mask: self.bypass_mask,
            max_phys: self.max_phys(),
            max_segment: self.spec.max_segment_size,
            source_align_mask: self.state.source_align_mask,
            client: true,
            cursor: self.state.cursor,
        };
        let mut visitor = TransferVisitor {
            buf,
            buf_offset: 0,
            remaining: length,
            translate,
            phys: &*phys,
        };

        let state = &mut self.state;
        let BouncePlan {
            buffer, next_remap, ..
        } = &mut state.bounce;
        let remap = match buffer {
            Some(BounceBuffer::Frames { frames, .. }) => Some(RemapLookup {
                frames,
                next: next_remap,
            }),
            _ => None,
        };

        let mut emitted = 0;
        // The visitor stops the walk once the buffer is satisfied.
        let _ = generate(
            &params,
            &mut state.walker,
            remap,
            &mut visitor,
            &mut abs,
            &mut emitted,
            u32::MAX,
        );
        length - visitor.remaining
    }
}

impl Drop for DmaCommand {
    fn drop(&mut self) {
        self.clear_memory(true).ok();
    }
}
