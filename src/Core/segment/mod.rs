// Channel segment: one named shared memory region holding a header and a small ring of slots.
//
// This is the only module that reinterprets mapped bytes as typed structs. Everything
// above it goes through the accessors here.

use crate::Channel::Structs::Descriptor_Structs::PayloadDescriptor;
use crate::Core::futex;
use crate::Core::process::{current_pid, monotonic_ns, pid_alive};
use crate::Core::SharedMemory::{self, SharedMemoryBackend};
use crate::error::{Error, Result};
use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;

mod debug;
pub mod layout;

use layout::*;

/// Spins on the metadata lock before sleeping on it.
const LOCK_SPINS: u32 = 64;

/// Sleep slice while the metadata lock is held by someone else.
const LOCK_SLICE: Duration = Duration::from_millis(5);

/// A reader entry claimed by one Source.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReaderHandle {
    pub index: usize,
    pub generation: u64,
}

/// A mapped channel segment.
pub struct Segment {
    shm: Box<dyn SharedMemoryBackend>,
    header: *const SegmentHeader,
    channel: String,
    descriptor: PayloadDescriptor,
    geometry: SegmentGeometry,
}

// All shared state behind `header` is atomic or immutable after initialisation.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

/// Holds the segment metadata lock; released on drop.
pub struct SegmentGuard<'a> {
    segment: &'a Segment,
}

impl Drop for SegmentGuard<'_> {
    fn drop(&mut self) {
        let word = &self.segment.header().lock;
        word.store(0, Ordering::Release);
        futex::futex_wake_all(word);
    }
}

impl Segment {
    /// Create and initialise a fresh segment under the shm object name `object`.
    pub fn allocate(
        object: &str,
        channel: &str,
        descriptor: &PayloadDescriptor,
        slot_count: usize,
        reader_liveness: Duration,
    ) -> Result<Self> {
        descriptor.validate()?;
        let reader_liveness_ns = u64::try_from(reader_liveness.as_nanos())
            .ok()
            .filter(|&ns| ns > 0)
            .ok_or_else(|| {
                Error::invalid_config("reader_liveness_timeout", "must be non-zero and finite")
            })?;
        if !(MIN_SLOTS..=MAX_SLOTS).contains(&slot_count) {
            return Err(Error::invalid_config(
                "slot_count",
                format!("must be between {} and {}, got {}", MIN_SLOTS, MAX_SLOTS, slot_count),
            ));
        }
        let geometry = SegmentGeometry::compute(descriptor.max_payload_size(), slot_count)
            .ok_or_else(|| Error::invalid_descriptor("segment size overflows"))?;

        let shm = SharedMemory::create_shared_memory(object, geometry.total_size)?;

        let header_ptr = shm.as_ptr() as *mut SegmentHeader;
        if (header_ptr as usize) % std::mem::align_of::<SegmentHeader>() != 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "Shared memory not properly aligned",
            )));
        }

        // Fresh pages are zero-filled, which is a valid value for every atomic in the
        // header and marks every slot and reader entry as empty.
        unsafe {
            let h = &mut *header_ptr;
            h.version = LAYOUT_VERSION;
            h.header_size = SEGMENT_HEADER_SIZE as u32;
            h.slot_count = slot_count as u32;
            h.slot_stride = geometry.slot_stride as u64;
            h.slots_offset = geometry.slots_offset as u64;
            h.total_size = geometry.total_size as u64;
            h.reader_liveness_ns = reader_liveness_ns;
            h.descriptor = descriptor.encode();
        }

        let segment = Self {
            shm,
            header: header_ptr,
            channel: channel.to_owned(),
            descriptor: *descriptor,
            geometry,
        };

        let header = segment.header();
        header.sink_pid.store(current_pid(), Ordering::Relaxed);
        header.state.store(ChannelState::Bound as u32, Ordering::Relaxed);
        // Publish: everything above becomes visible to whoever sees the magic
        header.magic.store(MAGIC_NUMBER, Ordering::Release);

        log::debug!(
            "allocated channel '{}' ({}, {} slots, {} bytes)",
            channel,
            descriptor,
            slot_count,
            geometry.total_size
        );
        Ok(segment)
    }

    /// Map an existing, initialised segment.
    pub fn open(object: &str, channel: &str) -> Result<Self> {
        let not_found = || Error::NotFound {
            name: channel.to_owned(),
        };
        let corrupt = |message: String| Error::Corrupt {
            name: channel.to_owned(),
            message,
        };

        let shm = match SharedMemory::attach_shared_memory(object) {
            Ok(shm) => shm,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };

        if shm.size() < SEGMENT_HEADER_SIZE {
            // Creator has not finished sizing it
            return Err(not_found());
        }

        let header = shm.as_ptr() as *const SegmentHeader;
        let h = unsafe { &*header };

        match h.magic.load(Ordering::Acquire) {
            MAGIC_NUMBER => {}
            0 => return Err(not_found()),
            other => return Err(corrupt(format!("bad magic {:#x}", other))),
        }
        if h.version != LAYOUT_VERSION {
            return Err(corrupt(format!(
                "layout version {}, expected {}",
                h.version, LAYOUT_VERSION
            )));
        }
        if h.header_size as usize != SEGMENT_HEADER_SIZE {
            return Err(corrupt(format!(
                "header size {}, expected {}",
                h.header_size, SEGMENT_HEADER_SIZE
            )));
        }

        let descriptor = PayloadDescriptor::decode(&h.descriptor)
            .map_err(|e| corrupt(format!("descriptor: {}", e)))?;
        let slot_count = h.slot_count as usize;
        let geometry = SegmentGeometry::compute(descriptor.max_payload_size(), slot_count)
            .ok_or_else(|| corrupt("segment size overflows".into()))?;
        if h.reader_liveness_ns == 0 {
            return Err(corrupt("reader liveness timeout is zero".into()));
        }
        if !(MIN_SLOTS..=MAX_SLOTS).contains(&slot_count)
            || geometry.slot_stride as u64 != h.slot_stride
            || geometry.slots_offset as u64 != h.slots_offset
            || geometry.total_size > shm.size()
        {
            return Err(corrupt("slot geometry does not match descriptor".into()));
        }

        Ok(Self {
            shm,
            header,
            channel: channel.to_owned(),
            descriptor,
            geometry,
        })
    }

    #[inline]
    pub fn header(&self) -> &SegmentHeader {
        // Valid for as long as `shm` keeps the mapping alive
        unsafe { &*self.header }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn object_name(&self) -> &str {
        self.shm.name()
    }

    pub fn descriptor(&self) -> &PayloadDescriptor {
        &self.descriptor
    }

    pub fn geometry(&self) -> &SegmentGeometry {
        &self.geometry
    }

    pub fn slot_count(&self) -> usize {
        self.geometry.slot_count
    }

    pub fn max_payload(&self) -> usize {
        self.descriptor.max_payload_size() as usize
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u32(self.header().state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Reader liveness timeout the Sink advertised when it created the segment.
    pub fn reader_liveness_timeout(&self) -> Duration {
        Duration::from_nanos(self.header().reader_liveness_ns)
    }

    pub fn sink_pid(&self) -> u32 {
        self.header().sink_pid.load(Ordering::Acquire)
    }

    pub fn sink_alive(&self) -> bool {
        pid_alive(self.sink_pid())
    }

    /// Take the metadata lock.
    ///
    /// The word holds the owner's pid. If the owner process has died while holding
    /// it, the lock is taken over; critical sections only touch atomics, so there is
    /// no half-updated state to repair beyond what the atomics already show.
    pub fn lock(&self) -> SegmentGuard<'_> {
        let me = current_pid();
        let word = &self.header().lock;
        let mut spins = 0;

        loop {
            let owner = match word.compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return SegmentGuard { segment: self },
                Err(owner) => owner,
            };

            if spins < LOCK_SPINS {
                spins += 1;
                std::hint::spin_loop();
                continue;
            }

            if !pid_alive(owner) {
                if word
                    .compare_exchange(owner, me, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    log::warn!(
                        "channel '{}': took over lock held by dead process {}",
                        self.channel,
                        owner
                    );
                    return SegmentGuard { segment: self };
                }
                continue;
            }

            futex::futex_wait(word, owner, LOCK_SLICE);
        }
    }

    #[inline]
    fn slot_base(&self, index: usize) -> *mut u8 {
        assert!(index < self.geometry.slot_count, "slot index out of range");
        unsafe {
            self.shm
                .as_ptr()
                .add(self.geometry.slots_offset + index * self.geometry.slot_stride)
        }
    }

    pub fn slot_header(&self, index: usize) -> &SlotHeader {
        unsafe { &*(self.slot_base(index) as *const SlotHeader) }
    }

    /// Read-only view of the first `len` payload bytes of a slot.
    ///
    /// The caller must hold an unacknowledged reference to the sample in this slot,
    /// which keeps the Sink from reusing it.
    pub fn payload(&self, index: usize, len: usize) -> &[u8] {
        let len = len.min(self.max_payload());
        unsafe { std::slice::from_raw_parts(self.slot_base(index).add(SLOT_HEADER_SIZE), len) }
    }

    /// Writable view of a slot's whole payload area.
    ///
    /// # Safety
    /// Only the Sink may call this, and only for a slot no attached reader can
    /// still be reading (see `Sink::next_slot`). At most one such view may exist.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn payload_mut(&self, index: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(
            self.slot_base(index).add(SLOT_HEADER_SIZE),
            self.max_payload(),
        )
    }

    pub fn reader(&self, index: usize) -> &ReaderEntry {
        &self.header().readers[index]
    }

    /// Whether `handle` still owns its reader entry.
    pub fn reader_is_current(&self, handle: ReaderHandle) -> bool {
        let entry = self.reader(handle.index);
        entry.state.load(Ordering::Acquire) == READER_ATTACHED
            && entry.generation.load(Ordering::Acquire) == handle.generation
    }

    /// Claim a free reader entry. The new reader starts caught up with the latest sample.
    pub fn attach_reader(&self, _guard: &SegmentGuard<'_>) -> Result<ReaderHandle> {
        let header = self.header();
        let latest = header.latest_seq.load(Ordering::Acquire);

        for (index, entry) in header.readers.iter().enumerate() {
            if entry.state.load(Ordering::Acquire) != READER_FREE {
                continue;
            }
            let generation = entry.generation.load(Ordering::Relaxed) + 1;
            entry.generation.store(generation, Ordering::Relaxed);
            entry.pid.store(current_pid(), Ordering::Relaxed);
            entry.acked_seq.store(latest, Ordering::Relaxed);
            entry.heartbeat_ns.store(monotonic_ns(), Ordering::Relaxed);
            entry.state.store(READER_ATTACHED, Ordering::Release);
            header.reader_count.fetch_add(1, Ordering::AcqRel);
            return Ok(ReaderHandle { index, generation });
        }

        Err(Error::TooManyReaders {
            name: self.channel.clone(),
            max: MAX_READERS,
        })
    }

    /// Free a reader entry if `handle` still owns it. Returns whether it did.
    pub fn detach_reader(&self, _guard: &SegmentGuard<'_>, handle: ReaderHandle) -> bool {
        if !self.reader_is_current(handle) {
            return false;
        }
        self.free_reader(handle.index);
        true
    }

    /// Free entry `index` unconditionally (detach or eviction).
    pub fn free_reader(&self, index: usize) {
        let entry = self.reader(index);
        if entry
            .state
            .compare_exchange(READER_ATTACHED, READER_FREE, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.header().reader_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Attached entries as `(index, pid, acked_seq, heartbeat_ns)`.
    pub fn attached_readers(&self) -> impl Iterator<Item = (usize, u32, u64, u64)> + '_ {
        self.header()
            .readers
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state.load(Ordering::Acquire) == READER_ATTACHED)
            .map(|(i, e)| {
                (
                    i,
                    e.pid.load(Ordering::Relaxed),
                    e.acked_seq.load(Ordering::Acquire),
                    e.heartbeat_ns.load(Ordering::Acquire),
                )
            })
    }

    pub fn reader_count(&self) -> usize {
        self.header().reader_count.load(Ordering::Acquire) as usize
    }

    /// Latch end-of-stream and wake both sides. Idempotent.
    pub fn close(&self) -> bool {
        let previous = self
            .header()
            .state
            .swap(ChannelState::Closed as u32, Ordering::AcqRel);
        futex::signal(&self.header().publish_signal);
        futex::signal(&self.header().release_signal);
        previous != ChannelState::Closed as u32
    }
}
