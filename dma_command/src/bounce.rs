// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounce buffer planning and execution: preflight discovery of misaligned
//! or device-unreachable memory, bounce allocation, byte movement around the
//! transfer, and release.

use crate::gen::generate;
use crate::gen::GenParams;
use crate::gen::SegmentVisitor;
use crate::mapper::DmaMapper;
use crate::memory::Direction;
use crate::memory::FrameList;
use crate::memory::PhysMemory;
use crate::memory::PAGE_MASK;
use crate::memory::PAGE_SHIFT;
use crate::memory::PAGE_SIZE;
use crate::select_source;
use crate::DmaCommand;
use crate::DmaError;
use crate::MappingMode;
use crate::Segment;

/// Physical mask for the contiguous fallback bounce: page aligned and below
/// 4GB, reachable by any addressing-limited device that needs bouncing.
const LOW32_PHYS_MASK: u64 = 0xffff_f000;

/// Operations for one planner pass. Sync flags may combine with prepare or
/// complete passes; a client walk never goes through the planner.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct WalkOps {
    /// Copy bounce to source memory.
    pub sync_in: bool,
    /// Copy source memory to bounce.
    pub sync_out: bool,
    /// Copy regardless of the transfer direction.
    pub sync_always: bool,
    /// Discover misalignment and unreachable pages without allocating.
    pub preflight: bool,
    /// Force the double-buffer plan instead of walking.
    pub double_buffer: bool,
    /// Allocate and populate the bounce plan.
    pub prepare: bool,
    /// Release bounce resources.
    pub complete: bool,
}

/// Whether a pass moves bytes for the region's transfer direction.
///
/// An unknown direction always copies.
pub(crate) fn should_copy(op: WalkOps, direction: Direction) -> bool {
    if matches!(direction, Direction::None) || op.sync_always {
        return true;
    }
    let wanted = if op.sync_in {
        Direction::In
    } else {
        Direction::Out
    };
    wanted.intersects(direction)
}

/// One reserved bounce frame and the source page it stands in for.
#[derive(Debug, Copy, Clone)]
pub(crate) struct RemapFrame {
    /// Physical address of the bounce frame.
    pub addr: u64,
    /// Source page number this frame covers, assigned by the prepare walk.
    pub source_page: u64,
}

/// The bounce resources reserved for one prepare.
#[derive(Debug)]
pub(crate) enum BounceBuffer {
    /// Individually reserved page frames, rewritten into the segment stream
    /// page by page.
    Frames {
        list: FrameList,
        frames: Vec<RemapFrame>,
    },
    /// A physically contiguous buffer standing in for the whole prepared
    /// range.
    Contiguous {
        list: FrameList,
        /// Host physical address of the buffer, used for byte movement.
        host_base: u64,
        /// Address the device uses for the buffer: the mapper window base
        /// once one is established, the host address until then.
        device_base: u64,
    },
}

/// Planning state produced by preflight and consumed until complete.
#[derive(Debug, Default)]
pub(crate) struct BouncePlan {
    /// Number of bounce pages the prepared range needs.
    pub page_count: u64,
    pub buffer: Option<BounceBuffer>,
    /// Frame position of the planner's assign/copy walks.
    pub copy_cursor: usize,
    /// Frame hint for the generator's sparse remap lookup.
    pub next_remap: usize,
    /// Bounce resources are allocated and usable for syncs.
    pub live: bool,
}

/// Planner pass visitor: sees the raw (untranslated) pieces of the prepared
/// range and accounts, assigns, or copies them against the bounce plan.
struct PlannerVisitor<'a> {
    op: WalkOps,
    direction: Direction,
    /// Highest device-reachable address for planning purposes.
    max_phys: u64,
    source_align_mask: u64,
    double_buffer: bool,
    misaligned: &'a mut bool,
    page_count: &'a mut u64,
    frames: Option<&'a mut Vec<RemapFrame>>,
    copy_cursor: &'a mut usize,
    translate: Option<&'a dyn DmaMapper>,
    phys: &'a dyn PhysMemory,
}

impl SegmentVisitor for PlannerVisitor<'_> {
    fn segment(&mut self, segment: Segment, _index: u32) -> Result<(), DmaError> {
        let mut addr = segment.addr;
        let mut len = segment.len;
        debug_assert_ne!(addr, 0);
        debug_assert_ne!(len, 0);

        if !*self.misaligned && addr & self.source_align_mask != 0 {
            *self.misaligned = true;
            tracing::debug!(
                addr,
                len,
                mask = self.source_align_mask,
                "misaligned source segment"
            );
        }
        if *self.misaligned && self.op.preflight {
            return Err(DmaError::NotAligned);
        }

        if !self.double_buffer {
            if addr + len - 1 <= self.max_phys {
                len = 0;
            } else if addr <= self.max_phys {
                // Only the tail past the ceiling needs bouncing.
                let tail = addr + len - 1 - self.max_phys;
                addr = self.max_phys + 1;
                len = tail;
                tracing::debug!(addr, len, "tail past the address ceiling");
            }
        }
        if len == 0 {
            return Ok(());
        }

        let num_pages = ((addr & PAGE_MASK) + len + PAGE_MASK) >> PAGE_SHIFT;

        if self.op.preflight {
            *self.page_count += num_pages;
            return Ok(());
        }

        let mut assigned = false;
        if self.op.prepare {
            let frames = self
                .frames
                .as_mut()
                .expect("bounce frames are reserved before the prepare walk");
            for idx in 0..num_pages as usize {
                frames[*self.copy_cursor + idx].source_page = (addr >> PAGE_SHIFT) + idx as u64;
            }
            assigned = true;
        }

        if !assigned || should_copy(self.op, self.direction) {
            for idx in 0..num_pages as usize {
                if !should_copy(self.op, self.direction) {
                    continue;
                }
                let frame = self
                    .frames
                    .as_ref()
                    .expect("bounce frames are reserved before copy walks")[*self.copy_cursor + idx];
                let cpu_addr = match self.translate {
                    Some(mapper) => mapper.map_addr(addr),
                    None => addr,
                };
                let mut bounce_addr = frame.addr;
                if !self.double_buffer {
                    bounce_addr += addr & PAGE_MASK;
                }
                let chunk = (PAGE_SIZE - (addr & PAGE_MASK)).min(len);
                if self.op.sync_in {
                    self.phys.copy_phys(bounce_addr, cpu_addr, chunk);
                } else {
                    self.phys.copy_phys(cpu_addr, bounce_addr, chunk);
                }
                addr += chunk;
                len -= chunk;
            }
        }
        *self.copy_cursor += num_pages as usize;
        Ok(())
    }
}

impl DmaCommand {
    /// Runs the planner passes selected by `op` over the prepared range.
    pub(crate) fn walk_all(&mut self, mut op: WalkOps) -> Result<(), DmaError> {
        let mut result = Ok(());

        if op.preflight {
            self.state.misaligned = false;
            self.state.double_buffer = false;
            self.state.bounce = BouncePlan::default();

            if !op.double_buffer {
                result = self.planner_walk(op);
            }

            let forced = op.double_buffer;
            op.preflight = false;
            self.state.double_buffer = self.state.misaligned || forced;
            if self.state.double_buffer {
                self.state.bounce.page_count =
                    (self.state.prepared_length + PAGE_MASK) >> PAGE_SHIFT;
            }

            if self.state.bounce.page_count != 0 {
                tracing::debug!(
                    pages = self.state.bounce.page_count,
                    double_buffer = self.state.double_buffer,
                    "bounce plan"
                );
                let mut reserved = false;
                if !self.state.double_buffer {
                    assert!(
                        self.mapper.is_none(),
                        "bounce frames planned with a mapper interposed"
                    );
                    match self.bounce_alloc.alloc_frames(self.state.bounce.page_count) {
                        Ok(list) => {
                            let frames = list
                                .pfns()
                                .iter()
                                .map(|&pfn| RemapFrame {
                                    addr: pfn << PAGE_SHIFT,
                                    source_page: 0,
                                })
                                .collect();
                            self.state.bounce.buffer =
                                Some(BounceBuffer::Frames { list, frames });
                            self.state.bounce.copy_cursor = 0;
                            result = self.planner_walk(op);
                            self.state.bounce.live = true;
                            // Any requested copy already happened in the
                            // prepare walk.
                            op.sync_in = false;
                            op.sync_out = false;
                            reserved = true;
                        }
                        Err(err) => {
                            tracing::warn!(
                                pages = self.state.bounce.page_count,
                                error = %err,
                                "falling back to a contiguous bounce buffer"
                            );
                        }
                    }
                }
                if !reserved {
                    match self
                        .bounce_alloc
                        .alloc_contiguous(self.state.prepared_length, LOW32_PHYS_MASK)
                    {
                        Ok(list) => {
                            let base = list.base_addr();
                            self.state.bounce.buffer = Some(BounceBuffer::Contiguous {
                                list,
                                host_base: base,
                                device_base: base,
                            });
                            self.state.bounce.live = true;
                            result = Ok(());
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "bounce buffer allocation failed");
                            return Err(DmaError::NoResources);
                        }
                    }
                }
            }
        }

        if self.state.bounce.live && (op.sync_in || op.sync_out) && self.state.bounce.page_count != 0
        {
            if matches!(self.state.bounce.buffer, Some(BounceBuffer::Frames { .. })) {
                self.state.bounce.copy_cursor = 0;
                result = self.planner_walk(op);
            } else if matches!(self.state.bounce.buffer, Some(BounceBuffer::Contiguous { .. })) {
                result = if should_copy(op, self.summary.direction) {
                    self.sync_contiguous(op)
                } else {
                    Ok(())
                };
            }
        }

        if op.complete {
            // Dropping the frame lists returns them to their allocator.
            self.state.bounce = BouncePlan::default();
        }

        result
    }

    /// Walks the prepared range through the generator with the planner
    /// visitor attached.
    fn planner_walk(&mut self, op: WalkOps) -> Result<(), DmaError> {
        let Some(mem) = self.memory.clone() else {
            return Err(DmaError::NotReady);
        };
        let phys = self.phys.clone();
        let mapper = self.mapper.clone();

        let bits = self.spec.num_address_bits;
        // The planning ceiling applies only when the emitted addresses reach
        // the device untranslated: no mapper, or an already-reserved window.
        let plan_max_phys = if bits != 0
            && bits < 64
            && (self.state.window.is_some() || self.mapper.is_none())
        {
            (1u64 << bits) - 1
        } else {
            u64::MAX
        };
        let gen_max_phys = if bits != 0 && bits < 64 {
            (1u64 << bits) - 1
        } else {
            u64::MAX
        };

        let prepared_offset = self.state.prepared_offset;
        let prepared_length = self.state.prepared_length;
        let double_buffer = self.state.double_buffer;
        let source_align_mask = self.state.source_align_mask;
        let direction = self.summary.direction;
        let translate = if self.spec.mode == MappingMode::Mapped {
            mapper.as_deref()
        } else {
            None
        };

        self.maybe_reset_walker(prepared_offset);

        let source = select_source(&self.state, &mem, self.walk_mapped());
        let params = GenParams {
            source,
            prepared_offset,
            mem_length: prepared_offset + prepared_length,
            bypass_mask: self.bypass_mask,
            max_phys: gen_max_phys,
            max_segment: self.spec.max_segment_size,
            source_align_mask,
            client: false,
            cursor: false,
        };

        let state = &mut self.state;
        let BouncePlan {
            page_count,
            buffer,
            copy_cursor,
            ..
        } = &mut state.bounce;
        let frames = match buffer {
            Some(BounceBuffer::Frames { frames, .. }) => Some(frames),
            _ => None,
        };
        let mut visitor = PlannerVisitor {
            op,
            direction,
            max_phys: plan_max_phys,
            source_align_mask,
            double_buffer,
            misaligned: &mut state.misaligned,
            page_count,
            frames,
            copy_cursor,
            translate,
            phys: &*phys,
        };

        let mut offset = prepared_offset;
        let mut emitted = 0;
        generate(
            &params,
            &mut state.walker,
            None,
            &mut visitor,
            &mut offset,
            &mut emitted,
            u32::MAX,
        )
    }

    /// Moves the prepared range between the descriptor and the contiguous
    /// bounce buffer.
    fn sync_contiguous(&mut self, op: WalkOps) -> Result<(), DmaError> {
        let Some(mem) = self.memory.clone() else {
            return Err(DmaError::NotReady);
        };
        let Some(BounceBuffer::Contiguous { host_base, .. }) = &self.state.bounce.buffer else {
            return Ok(());
        };
        let base = *host_base;
        let offset = self.state.prepared_offset;
        let length = self.state.prepared_length;

        let mut buf = vec![0u8; PAGE_SIZE as usize];
        let mut done = 0;
        while done < length {
            let chunk = (length - done).min(PAGE_SIZE) as usize;
            if op.sync_in {
                self.phys.read_phys(base + done, &mut buf[..chunk]);
                if mem.write_bytes(offset + done, &buf[..chunk]) != chunk as u64 {
                    return Err(DmaError::Underrun);
                }
            } else {
                if mem.read_bytes(offset + done, &mut buf[..chunk]) != chunk as u64 {
                    return Err(DmaError::Underrun);
                }
                self.phys.write_phys(base + done, &buf[..chunk]);
            }
            done += chunk as u64;
        }
        Ok(())
    }
}
