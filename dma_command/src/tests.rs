// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end tests driving the engine against the emulated collaborators.

use crate::bounce::BounceBuffer;
use crate::emulated::EmulatedFrameAllocator;
use crate::emulated::EmulatedMapper;
use crate::emulated::EmulatedMemory;
use crate::emulated::EmulatedPhysMemory;
use crate::encode::SegmentFormat;
use crate::mapper::DmaMapper;
use crate::mapper::MapperDevice;
use crate::memory::CacheOp;
use crate::memory::Direction;
use crate::memory::PhysMemory;
use crate::memory::DmaMemory;
use crate::memory::MapSpec;
use crate::memory::MapperAlloc;
use crate::memory::MemorySummary;
use crate::memory::WalkOp;
use crate::CommandSpecification;
use crate::DmaCommand;
use crate::DmaError;
use crate::DmaManager;
use crate::MappingMode;
use crate::MappingOptions;
use crate::Segment;
use std::sync::Arc;

struct TestEnv {
    phys: Arc<EmulatedPhysMemory>,
    alloc: Arc<EmulatedFrameAllocator>,
    manager: DmaManager,
}

fn env() -> TestEnv {
    env_with_system_mapper(None)
}

fn env_with_system_mapper(mapper: Option<Arc<EmulatedMapper>>) -> TestEnv {
    let phys = Arc::new(EmulatedPhysMemory::new());
    let alloc = Arc::new(EmulatedFrameAllocator::new());
    let manager = DmaManager::new(
        phys.clone(),
        alloc.clone(),
        mapper.map(|mapper| mapper as Arc<dyn DmaMapper>),
    );
    TestEnv {
        phys,
        alloc,
        manager,
    }
}

fn spec(format: SegmentFormat, bits: u32, max_segment: u64, alignment: u64) -> CommandSpecification {
    CommandSpecification {
        format,
        num_address_bits: bits,
        max_segment_size: max_segment,
        max_transfer_size: 0,
        alignment,
        options: MappingOptions::default(),
    }
}

fn memory(env: &TestEnv, runs: &[(u64, u64)], direction: Direction) -> Arc<EmulatedMemory> {
    Arc::new(EmulatedMemory::new(
        env.phys.clone(),
        runs.iter().map(|&(addr, len)| Segment { addr, len }).collect(),
        direction,
    ))
}

/// Generates up to `capacity` Host64 segments and parses them back.
fn gen_host64(
    cmd: &mut DmaCommand,
    offset: &mut u64,
    capacity: u32,
) -> (Vec<Segment>, Result<(), DmaError>) {
    let mut out = vec![0u8; capacity as usize * 16];
    let mut count = capacity;
    let result = cmd.gen_segments(offset, &mut out, &mut count);
    let segments = (0..count as usize)
        .map(|index| {
            let at = index * 16;
            Segment {
                addr: u64::from_ne_bytes(out[at..at + 8].try_into().unwrap()),
                len: u64::from_ne_bytes(out[at + 8..at + 16].try_into().unwrap()),
            }
        })
        .collect();
    (segments, result)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn contiguous_aligned_region_emits_one_segment() {
    let env = env();
    let md = memory(&env, &[(0x1000, 4096)], Direction::InOut);
    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 64, 4096, 1), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    cmd.prepare(0, 4096, false, false).unwrap();

    let mut offset = 0;
    let (segments, result) = gen_host64(&mut cmd, &mut offset, 4);
    result.unwrap();
    assert_eq!(
        segments,
        vec![Segment {
            addr: 0x1000,
            len: 4096
        }]
    );
    assert_eq!(offset, 4096);

    cmd.complete(false, false).unwrap();
    assert_eq!(env.alloc.outstanding(), 0);
}

#[test]
fn max_segment_size_truncates() {
    let env = env();
    let md = memory(&env, &[(0x1000, 4096)], Direction::InOut);
    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 64, 1024, 1), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    cmd.prepare(0, 4096, false, false).unwrap();

    let mut offset = 0;
    let (segments, result) = gen_host64(&mut cmd, &mut offset, 8);
    result.unwrap();
    assert_eq!(
        segments,
        vec![
            Segment { addr: 0x1000, len: 1024 },
            Segment { addr: 0x1400, len: 1024 },
            Segment { addr: 0x1800, len: 1024 },
            Segment { addr: 0x1C00, len: 1024 },
        ]
    );
    assert_eq!(offset, 4096);
    cmd.complete(false, false).unwrap();
}

#[test]
fn generation_resumes_one_segment_at_a_time() {
    let env = env();
    let md = memory(&env, &[(0x1000, 4096)], Direction::InOut);
    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 64, 1024, 1), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    cmd.prepare(0, 4096, false, false).unwrap();

    let mut offset = 0;
    for index in 0..4u64 {
        let (segments, result) = gen_host64(&mut cmd, &mut offset, 1);
        result.unwrap();
        assert_eq!(
            segments,
            vec![Segment {
                addr: 0x1000 + index * 1024,
                len: 1024
            }]
        );
        assert_eq!(offset, (index + 1) * 1024);
    }
    let (_, result) = gen_host64(&mut cmd, &mut offset, 1);
    assert!(matches!(result, Err(DmaError::Overrun)));

    // Moving the offset back restarts the walk.
    offset = 0;
    let (segments, result) = gen_host64(&mut cmd, &mut offset, 8);
    result.unwrap();
    assert_eq!(segments.len(), 4);
    cmd.complete(false, false).unwrap();
}

#[test]
fn physically_contiguous_runs_coalesce() {
    let env = env();
    let md = memory(
        &env,
        &[(0x1000, 0x800), (0x1800, 0x800), (0x3000, 0x1000), (0x8000, 0x234)],
        Direction::InOut,
    );
    let length = md.len();
    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 64, 0x1000, 1), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    cmd.prepare(0, 0, false, false).unwrap();

    let mut offset = 0;
    let (segments, result) = gen_host64(&mut cmd, &mut offset, 8);
    result.unwrap();
    assert_eq!(
        segments,
        vec![
            Segment { addr: 0x1000, len: 0x1000 },
            Segment { addr: 0x3000, len: 0x1000 },
            Segment { addr: 0x8000, len: 0x234 },
        ]
    );
    // Full coverage, and no two adjacent segments left mergeable.
    assert_eq!(segments.iter().map(|s| s.len).sum::<u64>(), length);
    for pair in segments.windows(2) {
        assert_ne!(pair[0].addr + pair[0].len, pair[1].addr);
    }
    cmd.complete(false, false).unwrap();
}

#[test]
fn prepared_subrange_offsets_the_walk() {
    let env = env();
    let md = memory(&env, &[(0x1000, 0x2000)], Direction::InOut);
    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 64, 0, 1), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    cmd.prepare(0x800, 0x1000, false, false).unwrap();
    assert_eq!(cmd.prepared_range().unwrap(), (0x800, 0x1000));

    let mut offset = 0;
    let (segments, result) = gen_host64(&mut cmd, &mut offset, 4);
    result.unwrap();
    assert_eq!(
        segments,
        vec![Segment {
            addr: 0x1800,
            len: 0x1000
        }]
    );
    cmd.complete(false, false).unwrap();
}

#[test]
fn unreachable_page_bounces() {
    let env = env();
    let md = memory(
        &env,
        &[(0x1000, 4096), (0x1_0000_1000, 4096)],
        Direction::Out,
    );
    let source = pattern(4096, 7);
    env.phys.write_phys(0x1_0000_1000, &source);

    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 32, 0, 1), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    cmd.prepare(0, 8192, false, false).unwrap();

    // One bounce frame reserved for the unreachable page.
    assert_eq!(cmd.state.bounce.page_count, 1);
    assert_eq!(env.alloc.outstanding(), 1);
    let frame_addr = match &cmd.state.bounce.buffer {
        Some(BounceBuffer::Frames { frames, .. }) => frames[0].addr,
        other => panic!("unexpected bounce plan: {other:?}"),
    };

    cmd.synchronize(Direction::Out, false).unwrap();
    let mut bounced = vec![0u8; 4096];
    env.phys.read_phys(frame_addr, &mut bounced);
    assert_eq!(bounced, source);

    let mut offset = 0;
    let (segments, result) = gen_host64(&mut cmd, &mut offset, 8);
    result.unwrap();
    assert_eq!(
        segments,
        vec![
            Segment { addr: 0x1000, len: 4096 },
            Segment { addr: frame_addr, len: 4096 },
        ]
    );
    assert_eq!(offset, 8192);
    for segment in &segments {
        assert!(segment.addr + segment.len - 1 < 1 << 32);
    }

    cmd.complete(false, false).unwrap();
    assert_eq!(env.alloc.outstanding(), 0);
}

#[test]
fn misaligned_region_double_buffers() {
    let env = env();
    let md = memory(&env, &[(0x1003, 4093)], Direction::Out);
    let source = pattern(4093, 3);
    env.phys.write_phys(0x1003, &source);

    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 0, 0, 0x100), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    cmd.prepare(0, 4093, false, true).unwrap();
    assert!(cmd.state.misaligned);
    assert!(cmd.state.double_buffer);

    let mut offset = 0;
    let (segments, result) = gen_host64(&mut cmd, &mut offset, 4);
    result.unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].addr & 0xff, 0);
    assert_eq!(segments[0].len, 4093);

    // The double buffer holds an aligned copy of the source bytes.
    let mut bounced = vec![0u8; 4093];
    env.phys.read_phys(segments[0].addr, &mut bounced);
    assert_eq!(bounced, source);

    cmd.complete(false, false).unwrap();
    assert_eq!(env.alloc.outstanding(), 0);
}

#[test]
fn bypassed_mapping_sets_the_mask() {
    let mask = 0x8000_0000_0000_0000;
    let mapper = Arc::new(EmulatedMapper::with_bypass_mask(mask));
    let env = env_with_system_mapper(Some(mapper));
    let md = memory(&env, &[(0x5000, 8192)], Direction::InOut);
    let mut cmd = env
        .manager
        .new_command(
            &CommandSpecification {
                options: MappingOptions {
                    mode: MappingMode::Bypassed,
                    iterate_only: false,
                },
                ..spec(SegmentFormat::Host64, 0, 0, 1)
            },
            None,
            None,
        )
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    // The descriptor offers no mapping support; the system mapping is best
    // effort and preparation proceeds without one.
    cmd.prepare(0, 0, false, false).unwrap();

    let mut offset = 0;
    let (segments, result) = gen_host64(&mut cmd, &mut offset, 4);
    result.unwrap();
    assert_eq!(
        segments,
        vec![Segment {
            addr: 0x5000 | mask,
            len: 8192
        }]
    );
    cmd.complete(false, false).unwrap();
}

#[test]
fn cursor_mode_rejects_unreachable_memory() {
    let env = env();
    let md = memory(&env, &[(0x1_0000_0000, 4096)], Direction::InOut);
    let mut cmd = env
        .manager
        .new_command(
            &CommandSpecification {
                options: MappingOptions {
                    mode: MappingMode::Mapped,
                    iterate_only: true,
                },
                ..spec(SegmentFormat::Host32, 0, 0, 1)
            },
            None,
            None,
        )
        .unwrap();
    assert_eq!(cmd.num_address_bits(), 32);
    cmd.set_memory(Some(md), false).unwrap();
    cmd.prepare(0, 0, false, false).unwrap();
    assert!(cmd.state.cursor);

    let mut offset = 0;
    let mut out = [0xaa_u8; 32];
    let mut count = 4;
    let result = cmd.gen_segments(&mut offset, &mut out, &mut count);
    assert!(matches!(result, Err(DmaError::TooLarge)));
    // Nothing was produced and no record was written.
    assert_eq!(count, 0);
    assert_eq!(offset, 0);
    assert_eq!(out, [0xaa; 32]);
    cmd.complete(false, false).unwrap();
}

#[test]
fn cursor_mode_rejects_misalignment() {
    let env = env();
    let md = memory(&env, &[(0x1004, 0x100)], Direction::InOut);
    let mut cmd = env
        .manager
        .new_command(
            &CommandSpecification {
                options: MappingOptions {
                    mode: MappingMode::Mapped,
                    iterate_only: true,
                },
                ..spec(SegmentFormat::Host64, 0, 0, 0x1000)
            },
            None,
            None,
        )
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    cmd.prepare(0, 0, false, false).unwrap();

    let mut offset = 0;
    let (_, result) = gen_host64(&mut cmd, &mut offset, 4);
    assert!(matches!(result, Err(DmaError::NotAligned)));
    cmd.complete(false, false).unwrap();
}

#[test]
fn force_double_buffer_replans_and_satisfies_constraints() {
    let env = env();
    let md = memory(
        &env,
        &[(0x1000, 4096), (0x1_0000_1000, 4096)],
        Direction::Out,
    );
    let source = pattern(8192, 11);
    env.phys.write_phys(0x1000, &source[..4096]);
    env.phys.write_phys(0x1_0000_1000, &source[4096..]);

    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 32, 0, 1), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    cmd.prepare(0, 0, false, true).unwrap();
    assert!(!cmd.state.double_buffer);

    cmd.synchronize(Direction::Out, true).unwrap();
    assert!(cmd.state.double_buffer);
    // The sparse frame was replaced by a two-page contiguous buffer.
    assert_eq!(env.alloc.outstanding(), 2);

    let mut offset = 0;
    let (segments, result) = gen_host64(&mut cmd, &mut offset, 8);
    result.unwrap();
    assert_eq!(segments.iter().map(|s| s.len).sum::<u64>(), 8192);
    let mut bounced = vec![0u8; 8192];
    let mut at = 0;
    for segment in &segments {
        assert!(segment.addr + segment.len - 1 < 1 << 32);
        env.phys
            .read_phys(segment.addr, &mut bounced[at..at + segment.len as usize]);
        at += segment.len as usize;
    }
    assert_eq!(bounced, source);

    // Forcing again is a no-op.
    cmd.synchronize(Direction::None, true).unwrap();
    cmd.complete(false, false).unwrap();
    assert_eq!(env.alloc.outstanding(), 0);
}

#[test]
fn nested_prepares_refcount() {
    let env = env();
    let md = memory(&env, &[(0x1000, 4096)], Direction::InOut);
    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 64, 0, 1), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();

    cmd.prepare(0, 4096, false, false).unwrap();
    cmd.prepare(0, 4096, false, false).unwrap();
    cmd.prepare(0, 4096, false, false).unwrap();
    // Nested prepares must match the first range.
    assert!(matches!(
        cmd.prepare(0, 2048, false, false),
        Err(DmaError::NotReady)
    ));

    cmd.complete(false, false).unwrap();
    cmd.complete(false, false).unwrap();
    assert!(cmd.prepared_range().is_ok());
    cmd.complete(false, false).unwrap();
    assert!(matches!(cmd.prepared_range(), Err(DmaError::NotReady)));
    assert!(matches!(
        cmd.complete(false, false),
        Err(DmaError::NotReady)
    ));

    let mut offset = 0;
    let (_, result) = gen_host64(&mut cmd, &mut offset, 1);
    assert!(matches!(result, Err(DmaError::NotReady)));
}

#[test]
fn set_memory_is_idempotent_and_guards_swaps() {
    let env = env();
    let md = memory(&env, &[(0x1000, 4096)], Direction::InOut);
    let other = memory(&env, &[(0x2000, 4096)], Direction::InOut);
    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 64, 0, 1), None, None)
        .unwrap();

    cmd.set_memory(Some(md.clone()), false).unwrap();
    assert_eq!(md.active_count(), 1);
    // Same descriptor again: no change.
    cmd.set_memory(Some(md.clone()), false).unwrap();
    assert_eq!(md.active_count(), 1);

    cmd.prepare(0, 0, false, false).unwrap();
    assert!(matches!(
        cmd.set_memory(Some(other.clone() as Arc<dyn DmaMemory>), false),
        Err(DmaError::Busy)
    ));
    // Same descriptor while prepared completes the prepares out.
    cmd.set_memory(Some(md.clone()), false).unwrap();
    assert!(matches!(cmd.prepared_range(), Err(DmaError::NotReady)));

    cmd.set_memory(Some(other as Arc<dyn DmaMemory>), false).unwrap();
    assert_eq!(md.active_count(), 0);
    cmd.clear_memory(false).unwrap();
}

#[test]
fn read_write_round_trip() {
    let env = env();
    let md = memory(&env, &[(0x3000, 8192)], Direction::InOut);
    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 0, 0, 1), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    cmd.prepare(0, 0, false, false).unwrap();

    let data = pattern(300, 42);
    assert_eq!(cmd.write_bytes(100, &data), 300);

    let mut readback = vec![0u8; 300];
    assert_eq!(cmd.read_bytes(100, &mut readback), 300);
    assert_eq!(readback, data);

    // The bytes landed in the backing physical memory.
    let mut raw = vec![0u8; 300];
    env.phys.read_phys(0x3000 + 100, &mut raw);
    assert_eq!(raw, data);

    // Transfers clamp to the prepared length.
    let tail = vec![0xcc_u8; 128];
    assert_eq!(cmd.write_bytes(8192 - 64, &tail), 64);
    assert_eq!(cmd.write_bytes(8192, &tail), 0);

    cmd.complete(false, false).unwrap();
}

#[test]
fn transfer_length_over_cap_is_rejected() {
    let env = env();
    let md = memory(&env, &[(0x1000, 8192)], Direction::InOut);
    let mut cmd = env
        .manager
        .new_command(
            &CommandSpecification {
                max_transfer_size: 4096,
                ..spec(SegmentFormat::Host64, 64, 0, 1)
            },
            None,
            None,
        )
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    assert!(matches!(
        cmd.prepare(0, 8192, false, false),
        Err(DmaError::NoSpace)
    ));
    // A zero length means the whole memory, which is also over the cap.
    assert!(matches!(cmd.prepare(0, 0, false, false), Err(DmaError::NoSpace)));
    cmd.prepare(0, 4096, false, false).unwrap();
    cmd.complete(false, false).unwrap();
}

#[test]
fn bounce_allocation_failure_rolls_back() {
    let env = env();
    let md = memory(
        &env,
        &[(0x1000, 4096), (0x1_0000_1000, 4096)],
        Direction::Out,
    );
    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 32, 0, 1), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();

    env.alloc.fail_frames(true);
    env.alloc.fail_contiguous(true);
    assert!(matches!(
        cmd.prepare(0, 0, false, false),
        Err(DmaError::NoResources)
    ));
    assert!(matches!(cmd.prepared_range(), Err(DmaError::NotReady)));
    assert_eq!(env.alloc.outstanding(), 0);

    // The frame path failing alone falls back to the contiguous buffer.
    env.alloc.fail_contiguous(false);
    cmd.prepare(0, 0, false, false).unwrap();
    assert!(matches!(
        cmd.state.bounce.buffer,
        Some(BounceBuffer::Contiguous { .. })
    ));
    cmd.complete(false, false).unwrap();
    assert_eq!(env.alloc.outstanding(), 0);
}

#[test]
fn noncoherent_mode_issues_cache_maintenance() {
    let env = env();
    let md = memory(&env, &[(0x1000, 4096)], Direction::InOut);
    let mut cmd = env
        .manager
        .new_command(
            &CommandSpecification {
                options: MappingOptions {
                    mode: MappingMode::NonCoherent,
                    iterate_only: false,
                },
                ..spec(SegmentFormat::Host64, 0, 0, 1)
            },
            None,
            None,
        )
        .unwrap();
    cmd.set_memory(Some(md.clone()), false).unwrap();

    cmd.prepare(0, 0, true, false).unwrap();
    assert_eq!(md.store_ops(), 1);
    assert_eq!(md.flush_ops(), 0);
    cmd.complete(true, false).unwrap();
    assert_eq!(md.flush_ops(), 1);
}

#[test]
fn local_mapper_window_synthesizes_contiguous_segments() {
    let env = env();
    let mapper = Arc::new(EmulatedMapper::new());
    let md = memory(&env, &[(0x9000, 4096), (0xb000, 4096)], Direction::InOut);
    let mut cmd = env
        .manager
        .new_command(
            &spec(SegmentFormat::Host64, 0, 0, 1),
            Some(mapper.clone()),
            None,
        )
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    cmd.prepare(0, 0, false, false).unwrap();
    assert!(cmd.state.map_contig);
    assert_eq!(mapper.outstanding_windows(), 1);

    let window_base = cmd.state.window.unwrap().base;
    let mut offset = 0;
    let (segments, result) = gen_host64(&mut cmd, &mut offset, 4);
    result.unwrap();
    assert_eq!(
        segments,
        vec![Segment {
            addr: window_base,
            len: 8192
        }]
    );

    cmd.complete(false, false).unwrap();
    assert_eq!(mapper.outstanding_windows(), 0);
}

#[test]
fn system_mapper_maps_through_the_descriptor() {
    let mapper = Arc::new(EmulatedMapper::new());
    let env = env_with_system_mapper(Some(mapper.clone()));
    let phys = env.phys.clone();
    let md = Arc::new(
        EmulatedMemory::new(
            phys,
            vec![Segment {
                addr: 0x6000,
                len: 8192,
            }],
            Direction::InOut,
        )
        .with_system_mapper(mapper.clone()),
    );
    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 0, 0, 1), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    cmd.prepare(0, 0, false, false).unwrap();
    assert!(cmd.state.map_contig);
    assert_eq!(mapper.outstanding_windows(), 1);

    let window_base = cmd.state.window.unwrap().base;
    let mut offset = 0;
    let (segments, result) = gen_host64(&mut cmd, &mut offset, 4);
    result.unwrap();
    assert_eq!(
        segments,
        vec![Segment {
            addr: window_base,
            len: 8192
        }]
    );

    // Byte transfers translate through the mapper page by page.
    let data = pattern(600, 9);
    assert_eq!(cmd.write_bytes(3900, &data), 600);
    let mut raw = vec![0u8; 600];
    env.phys.read_phys(0x6000 + 3900, &mut raw);
    assert_eq!(raw, data);

    cmd.complete(false, false).unwrap();
    assert_eq!(mapper.outstanding_windows(), 0);
}

#[test]
fn system_mapper_maps_a_double_buffered_bounce() {
    let mapper = Arc::new(EmulatedMapper::new());
    let env = env_with_system_mapper(Some(mapper.clone()));
    let md = memory(&env, &[(0x1003, 4093)], Direction::Out);
    let source = pattern(4093, 5);
    env.phys.write_phys(0x1003, &source);

    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 0, 0, 0x100), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    cmd.prepare(0, 0, false, true).unwrap();
    assert!(cmd.state.double_buffer);
    // The bounce run itself is mapped; emission carries its device address.
    assert_eq!(mapper.outstanding_windows(), 1);
    let window_base = cmd.state.window.unwrap().base;

    let mut offset = 0;
    let (segments, result) = gen_host64(&mut cmd, &mut offset, 4);
    result.unwrap();
    assert_eq!(
        segments,
        vec![Segment {
            addr: window_base,
            len: 4093
        }]
    );
    assert_eq!(segments[0].addr & 0xff, 0);

    // Translating the device address back lands on the bounce copy.
    let mut bounced = vec![0u8; 4093];
    env.phys
        .read_phys(mapper.map_addr(segments[0].addr), &mut bounced);
    assert_eq!(bounced, source);

    cmd.complete(false, false).unwrap();
    assert_eq!(mapper.outstanding_windows(), 0);
    assert_eq!(env.alloc.outstanding(), 0);
}

#[test]
fn drop_releases_everything() {
    let env = env();
    let md = memory(
        &env,
        &[(0x1000, 4096), (0x1_0000_1000, 4096)],
        Direction::Out,
    );
    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 32, 0, 1), None, None)
        .unwrap();
    cmd.set_memory(Some(md.clone()), false).unwrap();
    cmd.prepare(0, 0, false, false).unwrap();
    cmd.prepare(0, 0, false, false).unwrap();
    assert_eq!(env.alloc.outstanding(), 1);

    drop(cmd);
    assert_eq!(env.alloc.outstanding(), 0);
    assert_eq!(md.active_count(), 0);
}

#[test]
fn clone_command_copies_configuration_only() {
    let env = env();
    let md = memory(&env, &[(0x1000, 4096)], Direction::InOut);
    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Little64, 48, 0x800, 0x10), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    cmd.prepare(0, 0, false, false).unwrap();

    let clone = cmd.clone_command();
    assert_eq!(clone.num_address_bits(), 48);
    assert_eq!(clone.alignment(), 0x10);
    assert!(clone.memory().is_none());
    assert!(matches!(clone.prepared_range(), Err(DmaError::NotReady)));
    cmd.complete(false, false).unwrap();
}

#[test]
fn prepare_with_specification_revalidates() {
    let env = env();
    let md = memory(&env, &[(0x1000, 4096)], Direction::InOut);
    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 64, 0, 1), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();

    cmd.prepare(0, 0, false, false).unwrap();
    assert!(matches!(
        cmd.prepare_with_specification(
            &spec(SegmentFormat::Host64, 64, 0, 0x10),
            None,
            None,
            0,
            0,
            false,
            false,
        ),
        Err(DmaError::NotPermitted)
    ));
    cmd.complete(false, false).unwrap();

    // A 32-bit format with more than 32 address bits is contradictory.
    assert!(matches!(
        cmd.prepare_with_specification(
            &spec(SegmentFormat::Little32, 40, 0, 1),
            None,
            None,
            0,
            0,
            false,
            false,
        ),
        Err(DmaError::InvalidArgument)
    ));

    cmd.prepare_with_specification(&spec(SegmentFormat::Host64, 64, 0x400, 1), None, None, 0, 0, false, false)
        .unwrap();
    let mut offset = 0;
    let (segments, result) = gen_host64(&mut cmd, &mut offset, 8);
    result.unwrap();
    assert_eq!(segments.len(), 4);
    cmd.complete(false, false).unwrap();
}

#[test]
fn invalid_specifications_are_rejected() {
    let env = env();
    // Non-power-of-two alignment.
    assert!(matches!(
        env.manager
            .new_command(&spec(SegmentFormat::Host64, 0, 0, 3), None, None),
        Err(DmaError::InvalidArgument)
    ));
    // Address bits below the page shift.
    assert!(matches!(
        env.manager
            .new_command(&spec(SegmentFormat::Host64, 8, 0, 1), None, None),
        Err(DmaError::InvalidArgument)
    ));
    // 32-bit format with a wider cap.
    assert!(matches!(
        env.manager
            .new_command(&spec(SegmentFormat::Big32, 33, 0, 1), None, None),
        Err(DmaError::InvalidArgument)
    ));
    // Bypassed mode requires a mapper that supports bypass.
    let mapper = Arc::new(EmulatedMapper::new());
    assert!(matches!(
        env.manager.new_command(
            &CommandSpecification {
                options: MappingOptions {
                    mode: MappingMode::Bypassed,
                    iterate_only: false,
                },
                ..spec(SegmentFormat::Host64, 0, 0, 1)
            },
            Some(mapper),
            None,
        ),
        Err(DmaError::InvalidArgument)
    ));
}

#[test]
fn gen_segments_argument_validation() {
    let env = env();
    let md = memory(&env, &[(0x1000, 4096)], Direction::InOut);
    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 64, 0, 1), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    cmd.prepare(0, 0, false, false).unwrap();

    let mut offset = 0;
    let mut out = [0u8; 16];
    let mut count = 0;
    assert!(matches!(
        cmd.gen_segments(&mut offset, &mut out, &mut count),
        Err(DmaError::InvalidArgument)
    ));
    // Capacity larger than the buffer.
    let mut count = 2;
    assert!(matches!(
        cmd.gen_segments(&mut offset, &mut out, &mut count),
        Err(DmaError::InvalidArgument)
    ));
    cmd.complete(false, false).unwrap();
}

/// Delegates to an emulated descriptor but reports one byte short of every
/// read, like a descriptor whose backing went away mid-copy.
struct ShortReadMemory(EmulatedMemory);

impl DmaMemory for ShortReadMemory {
    fn characterize(&self, mapped: bool) -> Result<MemorySummary, DmaError> {
        self.0.characterize(mapped)
    }

    fn walk(
        &self,
        op: WalkOp,
        offset: u64,
        length: u64,
        mapped: bool,
    ) -> Result<Option<Segment>, DmaError> {
        self.0.walk(op, offset, length, mapped)
    }

    fn dma_map(
        &self,
        mapper: &dyn DmaMapper,
        device: Option<&dyn MapperDevice>,
        spec: &MapSpec,
        offset: u64,
        length: u64,
    ) -> Result<MapperAlloc, DmaError> {
        self.0.dma_map(mapper, device, spec, offset, length)
    }

    fn cache_op(&self, op: CacheOp, offset: u64, length: u64) {
        self.0.cache_op(op, offset, length)
    }

    fn read_bytes(&self, offset: u64, dst: &mut [u8]) -> u64 {
        self.0.read_bytes(offset, dst).saturating_sub(1)
    }

    fn write_bytes(&self, offset: u64, src: &[u8]) -> u64 {
        self.0.write_bytes(offset, src)
    }

    fn set_active(&self, active: bool) {
        self.0.set_active(active)
    }
}

#[test]
fn short_bounce_copy_surfaces_underrun() {
    let env = env();
    let md = Arc::new(ShortReadMemory(EmulatedMemory::new(
        env.phys.clone(),
        vec![Segment {
            addr: 0x1003,
            len: 4093,
        }],
        Direction::Out,
    )));
    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Host64, 0, 0, 0x100), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    // The prepare-time copy into the double buffer comes up short. The
    // prepare and its bounce stay in place; only the copy is reported.
    assert!(matches!(
        cmd.prepare(0, 0, false, true),
        Err(DmaError::Underrun)
    ));
    assert_eq!(cmd.prepared_range().unwrap(), (0, 4093));
    assert_eq!(env.alloc.outstanding(), 1);

    cmd.complete(false, false).unwrap();
    assert!(matches!(cmd.prepared_range(), Err(DmaError::NotReady)));
    assert_eq!(env.alloc.outstanding(), 0);
}

#[test]
fn explicit_record_formats_round_trip() {
    let env = env();
    let md = memory(&env, &[(0x1000, 0x800), (0x4000, 0x800)], Direction::InOut);
    let mut cmd = env
        .manager
        .new_command(&spec(SegmentFormat::Big32, 32, 0, 1), None, None)
        .unwrap();
    cmd.set_memory(Some(md), false).unwrap();
    cmd.prepare(0, 0, false, false).unwrap();

    let mut offset = 0;
    let mut out = [0u8; 16];
    let mut count = 2;
    cmd.gen_segments(&mut offset, &mut out, &mut count).unwrap();
    assert_eq!(count, 2);
    assert_eq!(u32::from_be_bytes(out[0..4].try_into().unwrap()), 0x1000);
    assert_eq!(u32::from_be_bytes(out[4..8].try_into().unwrap()), 0x800);
    assert_eq!(u32::from_be_bytes(out[8..12].try_into().unwrap()), 0x4000);
    assert_eq!(u32::from_be_bytes(out[12..16].try_into().unwrap()), 0x800);
    cmd.complete(false, false).unwrap();
}
