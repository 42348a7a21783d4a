// src/Channel/sink.rs

use super::config::ChannelConfig;
use super::registry::Registry;
use super::Structs::Descriptor_Structs::{PayloadDescriptor, SampleMeta};
use crate::Core::futex;
use crate::Core::process::{monotonic_ns, pid_alive};
use crate::Core::segment::layout::ChannelState;
use crate::Core::segment::Segment;
use crate::error::{Error, Result};
use std::fmt;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Longest single sleep inside a blocking call. Bounds shutdown latency.
pub(crate) const WAIT_SLICE: Duration = Duration::from_millis(20);

/// The producing end of a channel.
///
/// Owns the segment: creating a Sink binds the name, dropping it latches
/// end-of-stream and unlinks the name. Exactly one thread produces through it.
pub struct Sink {
    registry: Registry,
    segment: Segment,
    config: ChannelConfig,
    readers_ready: bool,
}

/// Exclusive write access to one slot, obtained from `Sink::next_slot`.
///
/// Nothing is visible to Sources until `publish`. Dropping it unpublished
/// leaves the slot free.
pub struct WritableSlot<'a> {
    sink: &'a mut Sink,
    index: usize,
}

impl Sink {
    /// Bind `name` and fix its payload descriptor.
    pub fn create(
        registry: &Registry,
        name: &str,
        descriptor: PayloadDescriptor,
        config: &ChannelConfig,
    ) -> Result<Self> {
        config.validate()?;
        descriptor.validate()?;
        let segment = registry.allocate(
            name,
            &descriptor,
            config.slot_count,
            config.reader_liveness_timeout,
        )?;

        log::debug!("sink bound to channel '{}' ({})", name, descriptor);
        Ok(Self {
            registry: registry.clone(),
            segment,
            config: config.clone(),
            readers_ready: config.expected_readers == 0,
        })
    }

    /// Exclusive access to a slot no attached Source can still be reading.
    ///
    /// Blocks while every candidate slot holds a sample some attached reader has not
    /// released yet. Readers that stop heartbeating are evicted while waiting and
    /// stop holding anything back.
    pub fn next_slot(&mut self) -> Result<WritableSlot<'_>> {
        if self.segment.is_closed() {
            return Err(self.closed());
        }
        if !self.readers_ready {
            self.wait_for_readers()?;
            self.readers_ready = true;
        }

        loop {
            let observed = self.segment.header().release_signal.load(Ordering::Acquire);

            if let Some(index) = self.find_free_slot() {
                return Ok(WritableSlot { sink: self, index });
            }
            if self.segment.is_closed() {
                return Err(self.closed());
            }
            if self.config.interrupted() {
                return Err(Error::Interrupted);
            }

            futex::futex_wait(&self.segment.header().release_signal, observed, WAIT_SLICE);
        }
    }

    /// Copy `bytes` into the next slot and publish it. Returns the sequence number.
    pub fn send(&mut self, bytes: &[u8]) -> Result<u64> {
        let max = self.segment.max_payload();
        if bytes.len() > max {
            return Err(Error::invalid_descriptor(format!(
                "payload of {} bytes exceeds slot size {}",
                bytes.len(),
                max
            )));
        }
        let mut slot = self.next_slot()?;
        slot.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
        slot.publish(SampleMeta::now(bytes.len()))
    }

    /// Latch end-of-stream. Wakes every waiting Source; idempotent.
    pub fn set_end_of_stream(&self) {
        if self.segment.close() {
            log::debug!(
                "channel '{}' closed after {} samples",
                self.name(),
                self.last_sequence()
            );
        }
    }

    pub fn name(&self) -> &str {
        self.segment.channel()
    }

    pub fn descriptor(&self) -> &PayloadDescriptor {
        self.segment.descriptor()
    }

    pub fn is_closed(&self) -> bool {
        self.segment.is_closed()
    }

    /// Sequence number of the last published sample, 0 before the first.
    pub fn last_sequence(&self) -> u64 {
        self.segment.header().latest_seq.load(Ordering::Acquire)
    }

    /// Sources currently attached.
    pub fn reader_count(&self) -> usize {
        self.segment.reader_count()
    }

    /// Every attached Source has released the latest sample.
    pub fn is_drained(&self) -> bool {
        let latest = self.last_sequence();
        self.segment
            .attached_readers()
            .all(|(_, _, acked, _)| acked >= latest)
    }

    fn closed(&self) -> Error {
        Error::AlreadyClosed {
            name: self.name().to_owned(),
        }
    }

    fn wait_for_readers(&self) -> Result<()> {
        log::debug!(
            "channel '{}' waiting for {} readers",
            self.name(),
            self.config.expected_readers
        );
        loop {
            let observed = self.segment.header().release_signal.load(Ordering::Acquire);
            if self.segment.reader_count() >= self.config.expected_readers {
                return Ok(());
            }
            if self.segment.is_closed() {
                return Err(self.closed());
            }
            if self.config.interrupted() {
                return Err(Error::Interrupted);
            }
            futex::futex_wait(&self.segment.header().release_signal, observed, WAIT_SLICE);
        }
    }

    /// Under the lock: evict dead readers, then pick the oldest slot that is not the
    /// latest sample and that every attached reader has acknowledged.
    fn find_free_slot(&self) -> Option<usize> {
        let _guard = self.segment.lock();
        self.evict_stale_readers();

        let min_acked = self
            .segment
            .attached_readers()
            .map(|(_, _, acked, _)| acked)
            .min()
            .unwrap_or(u64::MAX);

        let header = self.segment.header();
        let latest_seq = header.latest_seq.load(Ordering::Acquire);
        let latest_slot = header.latest_slot.load(Ordering::Acquire) as usize;

        (0..self.segment.slot_count())
            .filter(|&i| latest_seq == 0 || i != latest_slot)
            .map(|i| (i, self.segment.slot_header(i).seq.load(Ordering::Acquire)))
            .filter(|&(_, seq)| seq <= min_acked)
            .min_by_key(|&(_, seq)| seq)
            .map(|(i, _)| i)
    }

    /// Caller holds the segment lock.
    fn evict_stale_readers(&self) {
        let now = monotonic_ns();
        let limit = self.segment.header().reader_liveness_ns;

        let stale = self
            .segment
            .attached_readers()
            .filter(|&(_, _, _, heartbeat)| now.saturating_sub(heartbeat) > limit);

        for (index, pid, _, _) in stale {
            self.segment.free_reader(index);
            let reason = Error::ReaderTimeout {
                name: self.name().to_owned(),
                pid,
            };
            if pid_alive(pid) {
                log::warn!("{}; evicting it", reason);
            } else {
                log::warn!("{} (process exited); evicting it", reason);
            }
        }
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        self.set_end_of_stream();
        self.registry.release(self.name());
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_sink(self, f)
    }
}

impl<'a> WritableSlot<'a> {
    /// Slot index within the ring.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The whole payload area, `descriptor().max_payload_size()` bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Exclusive: find_free_slot only hands out slots no reader can be reading,
        // and the &mut borrow of the Sink rules out a second WritableSlot.
        unsafe { self.sink.segment.payload_mut(self.index) }
    }

    /// Make the written slot the latest sample and wake every Source.
    /// Returns the sample's sequence number.
    pub fn publish(self, meta: SampleMeta) -> Result<u64> {
        let segment = &self.sink.segment;
        if meta.len > segment.max_payload() {
            return Err(Error::invalid_descriptor(format!(
                "sample length {} exceeds slot size {}",
                meta.len,
                segment.max_payload()
            )));
        }

        let header = segment.header();
        let seq = {
            let _guard = segment.lock();
            if segment.is_closed() {
                return Err(self.sink.closed());
            }

            let seq = header.latest_seq.load(Ordering::Acquire) + 1;
            let slot = segment.slot_header(self.index);
            slot.len.store(meta.len as u64, Ordering::Relaxed);
            slot.timestamp_ns.store(meta.timestamp_ns, Ordering::Relaxed);
            // Payload bytes were written before the lock; the release below orders them
            slot.seq.store(seq, Ordering::Release);

            header.latest_slot.store(self.index as u32, Ordering::Release);
            header.latest_seq.store(seq, Ordering::Release);
            let _ = header.state.compare_exchange(
                ChannelState::Bound as u32,
                ChannelState::Streaming as u32,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            seq
        };

        futex::signal(&header.publish_signal);
        Ok(seq)
    }
}
