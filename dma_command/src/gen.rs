// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The segment generator: walks the physical pieces of the prepared range,
//! coalesces contiguous runs, applies the device's address and size
//! constraints, rewrites unreachable pieces to their bounce frames, and
//! emits the results through a visitor.

use crate::bounce::RemapFrame;
use crate::encode::SegmentFormat;
use crate::mapper::DmaMapper;
use crate::memory::DmaMemory;
use crate::memory::PhysMemory;
use crate::memory::WalkOp;
use crate::memory::PAGE_MASK;
use crate::memory::PAGE_SHIFT;
use crate::memory::PAGE_SIZE;
use crate::DmaError;
use crate::Segment;

/// Walk position retained between generator calls.
#[derive(Debug, Default)]
pub(crate) struct Walker {
    /// Offset the last walk ended at (or last fetched from, mid-walk).
    pub offset: u64,
    /// A fetched or truncated piece not yet consumed.
    pub pending: Option<Segment>,
    /// Whether the next descriptor walk must restart with [`WalkOp::First`].
    pub fresh: bool,
}

impl Walker {
    pub fn reset(&mut self) {
        *self = Walker {
            offset: 0,
            pending: None,
            fresh: true,
        };
    }
}

/// Where the generator obtains physical pieces from.
pub(crate) enum PieceSource<'a> {
    /// Walk the memory descriptor.
    Memory { mem: &'a dyn DmaMemory, mapped: bool },
    /// Synthesize from a contiguous I/O virtual window at `base + offset`.
    Window { base: u64 },
    /// Synthesize from the contiguous bounce buffer, which covers the
    /// prepared range starting at index zero.
    Bounce { base: u64 },
}

pub(crate) struct GenParams<'a> {
    pub source: PieceSource<'a>,
    pub prepared_offset: u64,
    /// `prepared_offset + prepared_length`.
    pub mem_length: u64,
    pub bypass_mask: u64,
    /// Highest emittable address, from the address-bit cap.
    pub max_phys: u64,
    pub max_segment: u64,
    pub source_align_mask: u64,
    /// Whether this walk produces device-visible segments (as opposed to a
    /// planner walk over raw pieces).
    pub client: bool,
    pub cursor: bool,
}

/// Receives generated segments in order.
pub(crate) trait SegmentVisitor {
    fn segment(&mut self, segment: Segment, index: u32) -> Result<(), DmaError>;
}

/// Bounce frame table for rewriting unreachable pieces, with a forward
/// moving hint index.
pub(crate) struct RemapLookup<'a> {
    pub frames: &'a [RemapFrame],
    pub next: &'a mut usize,
}

fn fetch(
    params: &GenParams<'_>,
    walker: &mut Walker,
    pos: u64,
) -> Result<Option<Segment>, DmaError> {
    walker.offset = pos;
    match params.source {
        PieceSource::Window { base } => Ok(Some(Segment {
            addr: base + pos,
            len: params.mem_length - pos,
        })),
        PieceSource::Bounce { base } => Ok(Some(Segment {
            addr: base + (pos - params.prepared_offset),
            len: params.mem_length - pos,
        })),
        PieceSource::Memory { mem, mapped } => {
            let op = if walker.fresh {
                WalkOp::First
            } else {
                WalkOp::Next
            };
            walker.fresh = false;
            mem.walk(op, pos, params.mem_length - pos, mapped)
        }
    }
}

/// Runs the generator from `*offset` (absolute) until the range, the
/// visitor capacity, or an error stops it.
///
/// On success `*offset` is the absolute end position; on an operational
/// error it is the position covered by the segments actually delivered.
/// `*emitted` is the number of segments delivered either way.
pub(crate) fn generate(
    params: &GenParams<'_>,
    walker: &mut Walker,
    mut remap: Option<RemapLookup<'_>>,
    visitor: &mut dyn SegmentVisitor,
    offset: &mut u64,
    emitted: &mut u32,
    capacity: u32,
) -> Result<(), DmaError> {
    let mut pos = *offset;
    let mut committed = pos;
    let mut cur: Option<Segment> = None;
    let mut end_of_walk = false;
    let mut seg_index = 0u32;
    let mut result = Ok(());

    while walker.pending.is_some() || (!end_of_walk && pos < params.mem_length) {
        if walker.pending.is_none() {
            match fetch(params, walker, pos)? {
                Some(piece) => {
                    debug_assert_ne!(piece.len, 0);
                    match &mut cur {
                        Some(seg) if seg.addr + seg.len == piece.addr => {
                            pos += piece.len;
                            seg.len += piece.len;
                        }
                        _ => walker.pending = Some(piece),
                    }
                }
                None => end_of_walk = true,
            }
        }

        if cur.is_none() {
            if let Some(piece) = walker.pending.take() {
                pos += piece.len;
                cur = Some(Segment {
                    addr: piece.addr | params.bypass_mask,
                    len: piece.len,
                });
            }
        }

        if walker.pending.is_none() {
            let Some(seg) = &mut cur else { break };

            if params.client && seg.addr + seg.len - 1 > params.max_phys {
                if params.cursor {
                    cur = None;
                    result = Err(DmaError::TooLarge);
                    break;
                } else if seg.addr <= params.max_phys {
                    // Clip at the ceiling; the tail goes back for the next
                    // round, where it resolves through the bounce plan.
                    let keep = params.max_phys + 1 - seg.addr;
                    let remain = seg.len - keep;
                    tracing::debug!(
                        addr = seg.addr,
                        len = seg.len,
                        keep,
                        "segment crosses the address ceiling"
                    );
                    walker.pending = Some(Segment {
                        addr: seg.addr + keep,
                        len: remain,
                    });
                    seg.len = keep;
                    pos -= remain;
                } else {
                    // Entirely unreachable: substitute the bounce frame
                    // reserved for this source page.
                    let lookup = remap
                        .as_mut()
                        .expect("unreachable segment outside any bounce plan");
                    let addr = seg.addr;
                    let page = addr >> PAGE_SHIFT;
                    let hinted = lookup
                        .frames
                        .get(*lookup.next)
                        .is_some_and(|frame| frame.source_page == page);
                    let index = if hinted {
                        *lookup.next
                    } else {
                        lookup
                            .frames
                            .iter()
                            .position(|frame| frame.source_page == page)
                            .expect("no bounce frame reserved for source page")
                    };
                    seg.addr = lookup.frames[index].addr + (addr & PAGE_MASK);
                    *lookup.next = index + 1;
                    let keep = PAGE_SIZE - (addr & PAGE_MASK);
                    if keep < seg.len {
                        let remain = seg.len - keep;
                        walker.pending = Some(Segment {
                            addr: addr + keep,
                            len: remain,
                        });
                        seg.len = keep;
                        pos -= remain;
                    }
                    tracing::debug!(from = addr, to = seg.addr, len = seg.len, "bounce remap");
                }
            }

            if seg.len > params.max_segment {
                let remain = seg.len - params.max_segment;
                walker.pending = Some(Segment {
                    addr: seg.addr + params.max_segment,
                    len: remain,
                });
                seg.len = params.max_segment;
                pos -= remain;
            }

            if params.cursor && seg.addr & params.source_align_mask != 0 {
                cur = None;
                result = Err(DmaError::NotAligned);
                break;
            }

            if pos >= params.mem_length {
                seg.len -= pos - params.mem_length;
                pos = params.mem_length;
                walker.pending = None;
                break;
            }
        }

        if walker.pending.is_some() {
            // Hold the last slot for the segment finished below.
            if seg_index + 1 == capacity {
                break;
            }
            if let Some(seg) = cur.take() {
                match visitor.segment(seg, seg_index) {
                    Ok(()) => {
                        seg_index += 1;
                        committed = pos;
                    }
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                }
            }
        }
    }

    if result.is_ok() {
        if let Some(seg) = cur.take() {
            match visitor.segment(seg, seg_index) {
                Ok(()) => {
                    seg_index += 1;
                    committed = pos;
                }
                Err(err) => result = Err(err),
            }
        }
    }

    *emitted = seg_index;
    match result {
        Ok(()) => {
            walker.offset = pos;
            *offset = pos;
            Ok(())
        }
        Err(err) => {
            *offset = committed;
            Err(err)
        }
    }
}

/// Emits segments into the caller's output buffer through the configured
/// format, range checking against the device address width first.
pub(crate) struct ClientVisitor<'a> {
    pub format: SegmentFormat,
    pub out: &'a mut [u8],
    pub num_address_bits: u32,
    /// Whether the address width applies to the emitted addresses (a
    /// command-local window is reserved, or there is no mapper at all).
    pub enforce_bits: bool,
}

impl SegmentVisitor for ClientVisitor<'_> {
    fn segment(&mut self, segment: Segment, index: u32) -> Result<(), DmaError> {
        if self.enforce_bits
            && self.num_address_bits != 0
            && self.num_address_bits < 64
            && (segment.addr + segment.len - 1) >> self.num_address_bits != 0
        {
            tracing::debug!(
                addr = segment.addr,
                len = segment.len,
                bits = self.num_address_bits,
                "segment exceeds the device address width"
            );
            return Err(DmaError::TooLarge);
        }
        self.format
            .write(segment, self.out, index)
            .map_err(|_| DmaError::TooLarge)
    }
}

/// Byte copy destination or source for [`TransferVisitor`].
pub(crate) enum TransferBuf<'a> {
    /// Device memory into the caller's buffer.
    Read(&'a mut [u8]),
    /// The caller's buffer into device memory.
    Write(&'a [u8]),
}

/// Copies bytes between the prepared range and a caller buffer, translating
/// device addresses page by page when a mapper is interposed.
pub(crate) struct TransferVisitor<'a> {
    pub buf: TransferBuf<'a>,
    pub buf_offset: usize,
    pub remaining: u64,
    pub translate: Option<&'a dyn DmaMapper>,
    pub phys: &'a dyn PhysMemory,
}

impl SegmentVisitor for TransferVisitor<'_> {
    fn segment(&mut self, segment: Segment, _index: u32) -> Result<(), DmaError> {
        let mut len = segment.len.min(self.remaining);
        self.remaining -= len;
        let mut io_addr = segment.addr;
        while len != 0 {
            let (cpu_addr, copy_len) = match self.translate {
                Some(mapper) => {
                    let copy_len = len.min(PAGE_SIZE - (io_addr & PAGE_MASK));
                    (mapper.map_addr(io_addr), copy_len)
                }
                None => (io_addr, len),
            };
            let at = self.buf_offset;
            match &mut self.buf {
                TransferBuf::Read(dst) => {
                    self.phys
                        .read_phys(cpu_addr, &mut dst[at..at + copy_len as usize])
                }
                TransferBuf::Write(src) => {
                    self.phys.write_phys(cpu_addr, &src[at..at + copy_len as usize])
                }
            }
            io_addr += copy_len;
            len -= copy_len;
            self.buf_offset += copy_len as usize;
        }
        if self.remaining == 0 {
            // Stop the walk; the caller only wanted this many bytes.
            Err(DmaError::Overrun)
        } else {
            Ok(())
        }
    }
}
