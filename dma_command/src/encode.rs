// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Output formats for device-visible segment records.

use crate::Segment;
use thiserror::Error;
use zerocopy::byteorder::BigEndian;
use zerocopy::byteorder::ByteOrder;
use zerocopy::byteorder::LittleEndian;
use zerocopy::byteorder::NativeEndian;
use zerocopy::byteorder::U32;
use zerocopy::byteorder::U64;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The serialized form of one segment in the caller's output buffer.
///
/// 32-bit formats produce 8-byte records and are only valid when the command
/// is limited to at most 32 address bits; 64-bit formats produce 16-byte
/// records. `Host` variants use native byte order, the others serialize
/// explicitly.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SegmentFormat {
    /// Native-endian 32-bit address and length.
    Host32,
    /// Big-endian 32-bit address and length.
    Big32,
    /// Little-endian 32-bit address and length.
    Little32,
    /// Native-endian 64-bit address and length.
    Host64,
    /// Big-endian 64-bit address and length.
    Big64,
    /// Little-endian 64-bit address and length.
    Little64,
}

/// Error returned when a segment does not fit a 32-bit record.
#[derive(Debug, Error)]
#[error("segment {addr:#x}+{len:#x} does not fit in a 32-bit record")]
pub struct RecordOverflow {
    addr: u64,
    len: u64,
}

#[derive(IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct Record32<O: ByteOrder> {
    addr: U32<O>,
    len: U32<O>,
}

#[derive(IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct Record64<O: ByteOrder> {
    addr: U64<O>,
    len: U64<O>,
}

impl SegmentFormat {
    /// The size in bytes of one serialized record.
    pub fn record_size(&self) -> usize {
        match self {
            SegmentFormat::Host32 | SegmentFormat::Big32 | SegmentFormat::Little32 => 8,
            SegmentFormat::Host64 | SegmentFormat::Big64 | SegmentFormat::Little64 => 16,
        }
    }

    /// Whether this format produces 32-bit records.
    pub fn is_32_bit(&self) -> bool {
        self.record_size() == 8
    }

    /// Serializes `segment` at `index * record_size` bytes into `out`.
    ///
    /// Fails without writing if a 32-bit format is given an address or
    /// length that does not fit in 32 bits.
    ///
    /// Panics if `out` is too short to hold the record at `index`.
    pub fn write(
        &self,
        segment: Segment,
        out: &mut [u8],
        index: u32,
    ) -> Result<(), RecordOverflow> {
        let at = index as usize * self.record_size();
        match self {
            SegmentFormat::Host32 => write32::<NativeEndian>(segment, out, at),
            SegmentFormat::Big32 => write32::<BigEndian>(segment, out, at),
            SegmentFormat::Little32 => write32::<LittleEndian>(segment, out, at),
            SegmentFormat::Host64 => write64::<NativeEndian>(segment, out, at),
            SegmentFormat::Big64 => write64::<BigEndian>(segment, out, at),
            SegmentFormat::Little64 => write64::<LittleEndian>(segment, out, at),
        }
    }
}

fn write32<O: ByteOrder>(
    segment: Segment,
    out: &mut [u8],
    at: usize,
) -> Result<(), RecordOverflow> {
    let overflow = || RecordOverflow {
        addr: segment.addr,
        len: segment.len,
    };
    let record = Record32::<O> {
        addr: U32::new(segment.addr.try_into().map_err(|_| overflow())?),
        len: U32::new(segment.len.try_into().map_err(|_| overflow())?),
    };
    out[at..at + 8].copy_from_slice(record.as_bytes());
    Ok(())
}

fn write64<O: ByteOrder>(
    segment: Segment,
    out: &mut [u8],
    at: usize,
) -> Result<(), RecordOverflow> {
    let record = Record64::<O> {
        addr: U64::new(segment.addr),
        len: U64::new(segment.len),
    };
    out[at..at + 16].copy_from_slice(record.as_bytes());
    Ok(())
}
