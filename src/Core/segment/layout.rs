use crate::Channel::Structs::Descriptor_Structs::DESCRIPTOR_RECORD_SIZE;
use crossbeam_utils::CachePadded;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64};

/// "SHMFLOW1". Stored last by the creator, so a visible magic means an initialised header.
pub const MAGIC_NUMBER: u64 = 0x5348_4D46_4C4F_5731;

/// Bumped whenever any struct in this file changes shape.
pub const LAYOUT_VERSION: u32 = 2;

/// Reader table capacity. Fixed so the header has a fixed size.
pub const MAX_READERS: usize = 32;

/// Ring size bounds. Two is the minimum for write-while-read.
pub const MIN_SLOTS: usize = 2;
pub const MAX_SLOTS: usize = 8;

/// Slots start on, and are strided by, this boundary.
pub const SLOT_ALIGN: usize = 128;

/// Channel lifecycle, stored in `SegmentHeader::state`.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Unbound = 0,
    Bound = 1,
    Streaming = 2,
    Closed = 3,
}

impl ChannelState {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => ChannelState::Bound,
            2 => ChannelState::Streaming,
            3 => ChannelState::Closed,
            _ => ChannelState::Unbound,
        }
    }
}

pub const READER_FREE: u32 = 0;
pub const READER_ATTACHED: u32 = 1;

/// One entry of the ReaderSet.
///
/// Padded to 128 bytes so heartbeats from different readers never share a line.
#[repr(C, align(128))]
pub struct ReaderEntry {
    /// READER_FREE or READER_ATTACHED
    pub state: AtomicU32,

    /// Pid of the attached process
    pub pid: AtomicU32,

    /// Incremented on every attach; a Source whose generation no longer matches
    /// was evicted.
    pub generation: AtomicU64,

    /// Highest sequence number this reader has released
    pub acked_seq: AtomicU64,

    /// CLOCK_MONOTONIC ns of the last sign of life
    pub heartbeat_ns: AtomicU64,
}

/// Per-slot header. The payload follows at `SLOT_HEADER_SIZE`.
#[repr(C, align(64))]
pub struct SlotHeader {
    /// Sequence number of the sample in this slot, 0 if never written
    pub seq: AtomicU64,

    /// Payload bytes in use
    pub len: AtomicU64,

    /// Sample timestamp, ns since the Unix epoch
    pub timestamp_ns: AtomicU64,
}

pub const SLOT_HEADER_SIZE: usize = size_of::<SlotHeader>();

/// The header at the very beginning of every channel segment.
///
/// Plain fields are written once by the creating Sink before `magic` is published
/// and never change afterwards. Everything mutable is atomic; multi-field updates
/// happen under `lock`.
#[repr(C, align(128))]
pub struct SegmentHeader {
    /// MAGIC_NUMBER once initialised, 0 before
    pub magic: AtomicU64,

    /// LAYOUT_VERSION of the creator
    pub version: u32,

    /// size_of::<SegmentHeader>() of the creator
    pub header_size: u32,

    /// Number of payload slots
    pub slot_count: u32,

    /// ChannelState
    pub state: AtomicU32,

    /// Distance between consecutive slots in bytes
    pub slot_stride: u64,

    /// Offset of slot 0 from the start of the segment
    pub slots_offset: u64,

    /// Total mapped size the creator asked for
    pub total_size: u64,

    /// Encoded PayloadDescriptor
    pub descriptor: [u8; DESCRIPTOR_RECORD_SIZE],

    /// Pid of the Sink process
    pub sink_pid: AtomicU32,

    /// Metadata lock word: 0 when free, owner pid when held
    pub lock: AtomicU32,

    /// Heartbeat age (ns) after which the Sink evicts a reader. Sources pace
    /// their heartbeat from this value, not from their own configuration.
    pub reader_liveness_ns: u64,

    /// Futex word consumers sleep on. Bumped on publish and end-of-stream.
    pub publish_signal: CachePadded<AtomicU32>,

    /// Futex word the producer sleeps on. Bumped on release, attach, detach.
    pub release_signal: CachePadded<AtomicU32>,

    /// Sequence number of the freshest published sample, 0 if none
    pub latest_seq: AtomicU64,

    /// Slot index holding `latest_seq`
    pub latest_slot: AtomicU32,

    /// Attached readers
    pub reader_count: AtomicU32,

    /// The ReaderSet
    pub readers: [ReaderEntry; MAX_READERS],
}

pub const SEGMENT_HEADER_SIZE: usize = size_of::<SegmentHeader>();

#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Byte geometry of a segment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SegmentGeometry {
    pub slot_count: usize,
    pub slot_stride: usize,
    pub slots_offset: usize,
    pub total_size: usize,
}

impl SegmentGeometry {
    /// Geometry for `slot_count` slots of `max_payload` bytes. None on overflow.
    pub fn compute(max_payload: u64, slot_count: usize) -> Option<Self> {
        let payload = usize::try_from(max_payload).ok()?;
        let stride = SLOT_HEADER_SIZE.checked_add(payload)?.checked_add(SLOT_ALIGN - 1)? & !(SLOT_ALIGN - 1);
        let slots_offset = align_up(SEGMENT_HEADER_SIZE, SLOT_ALIGN);
        let total_size = stride.checked_mul(slot_count)?.checked_add(slots_offset)?;
        Some(Self {
            slot_count,
            slot_stride: stride,
            slots_offset,
            total_size,
        })
    }
}
