// src/Channel/source.rs

use super::config::{heartbeat_period, ChannelConfig};
use super::registry::Registry;
use super::sink::WAIT_SLICE;
use super::Structs::Descriptor_Structs::PayloadDescriptor;
use crate::Core::futex;
use crate::Core::process::monotonic_ns;
use crate::Core::segment::{ReaderHandle, Segment};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const CONNECT_BACKOFF_START: Duration = Duration::from_millis(1);
const CONNECT_BACKOFF_MAX: Duration = Duration::from_millis(100);

/// A consuming end of a channel.
///
/// Reads samples in place from the Sink's segment. While attached, a background
/// thread keeps this reader's heartbeat fresh so the Sink can tell a slow reader
/// from a dead one.
pub struct Source {
    segment: Arc<Segment>,
    config: ChannelConfig,
    reader: Arc<Mutex<ReaderHandle>>,
    last_read: u64,
    producer_gone: bool,
    heartbeat: Option<Heartbeat>,
}

/// Outcome of `Source::wait`.
pub enum Received<'a> {
    Sample(ReadableSlot<'a>),
    EndOfStream,
}

impl Received<'_> {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Received::EndOfStream)
    }
}

/// Borrowed, read-only view of one published sample.
///
/// The Sink will not overwrite the slot until this is released, either
/// explicitly or by dropping it.
pub struct ReadableSlot<'a> {
    source: &'a Source,
    index: usize,
    seq: u64,
    len: usize,
    timestamp_ns: u64,
}

struct Heartbeat {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Source {
    /// Attach to channel `name`, retrying until its Sink exists.
    ///
    /// Fails with `ConnectTimeout` after `config.connect_timeout`, with
    /// `TypeMismatch` if the advertised descriptor is not what `config.expected`
    /// allows, and with `Interrupted` if shutdown is raised while waiting.
    pub fn connect(registry: &Registry, name: &str, config: &ChannelConfig) -> Result<Self> {
        let started = Instant::now();
        let deadline = started + config.connect_timeout;
        let mut backoff = CONNECT_BACKOFF_START;

        let segment = loop {
            match registry.open(name) {
                Ok(segment) => break segment,
                Err(Error::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }

            if config.interrupted() {
                return Err(Error::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ConnectTimeout {
                    name: name.to_owned(),
                    waited: now - started,
                });
            }

            thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(CONNECT_BACKOFF_MAX);
        };

        if !config.expected.accepts(segment.descriptor()) {
            return Err(Error::TypeMismatch {
                name: name.to_owned(),
                expected: config.expected.to_string(),
                found: segment.descriptor().to_string(),
            });
        }

        let handle = {
            let guard = segment.lock();
            segment.attach_reader(&guard)?
        };
        futex::signal(&segment.header().release_signal);

        let segment = Arc::new(segment);
        let reader = Arc::new(Mutex::new(handle));
        let last_read = segment.reader(handle.index).acked_seq.load(Ordering::Acquire);
        let period = heartbeat_period(segment.reader_liveness_timeout());
        let heartbeat = Heartbeat::spawn(&segment, &reader, period)?;

        log::debug!(
            "source attached to channel '{}' as reader {} ({})",
            name,
            handle.index,
            segment.descriptor()
        );
        Ok(Self {
            segment,
            config: config.clone(),
            reader,
            last_read,
            producer_gone: false,
            heartbeat: Some(heartbeat),
        })
    }

    /// Block until a sample newer than the last one read is published, or until
    /// end-of-stream.
    ///
    /// Returns the freshest sample; intermediate ones published while this reader
    /// was busy are skipped. Once `EndOfStream` is returned every later call
    /// returns it too.
    pub fn wait(&mut self) -> Result<Received<'_>> {
        loop {
            if self.producer_gone {
                return Ok(Received::EndOfStream);
            }

            let segment = Arc::clone(&self.segment);
            let header = segment.header();
            let observed = header.publish_signal.load(Ordering::Acquire);

            self.ensure_attached()?;

            if header.latest_seq.load(Ordering::Acquire) > self.last_read {
                let (index, seq, len, timestamp_ns) = {
                    let _guard = segment.lock();
                    let index = header.latest_slot.load(Ordering::Acquire) as usize;
                    let slot = segment.slot_header(index);
                    (
                        index,
                        slot.seq.load(Ordering::Acquire),
                        slot.len.load(Ordering::Acquire) as usize,
                        slot.timestamp_ns.load(Ordering::Acquire),
                    )
                };

                if seq > self.last_read {
                    self.last_read = seq;
                    return Ok(Received::Sample(ReadableSlot {
                        source: self,
                        index,
                        seq,
                        len,
                        timestamp_ns,
                    }));
                }
            }

            if segment.is_closed() {
                return Ok(Received::EndOfStream);
            }
            if self.config.interrupted() {
                return Err(Error::Interrupted);
            }
            if !segment.sink_alive() {
                log::warn!(
                    "sink of channel '{}' exited without closing it; treating as end-of-stream",
                    self.name()
                );
                self.producer_gone = true;
                return Ok(Received::EndOfStream);
            }

            futex::futex_wait(&header.publish_signal, observed, WAIT_SLICE);
        }
    }

    pub fn name(&self) -> &str {
        self.segment.channel()
    }

    /// The descriptor the Sink advertised at connect time.
    pub fn descriptor(&self) -> &PayloadDescriptor {
        self.segment.descriptor()
    }

    /// Sequence number of the last sample returned by `wait`.
    pub fn last_read(&self) -> u64 {
        self.last_read
    }

    /// Channel has latched end-of-stream.
    pub fn is_closed(&self) -> bool {
        self.segment.is_closed()
    }

    /// Re-attach if the Sink evicted this reader (we stalled past the liveness timeout).
    fn ensure_attached(&mut self) -> Result<()> {
        let handle = *self.reader.lock();
        if self.segment.reader_is_current(handle) {
            return Ok(());
        }

        let fresh = {
            let guard = self.segment.lock();
            self.segment.attach_reader(&guard)?
        };
        *self.reader.lock() = fresh;
        futex::signal(&self.segment.header().release_signal);

        log::warn!(
            "reader on channel '{}' was evicted by its sink; re-attached as reader {}",
            self.name(),
            fresh.index
        );
        // Samples before the re-attach may already be overwritten
        self.last_read = self
            .last_read
            .max(self.segment.reader(fresh.index).acked_seq.load(Ordering::Acquire));
        Ok(())
    }

    fn acknowledge(&self, seq: u64) {
        let handle = *self.reader.lock();
        if !self.segment.reader_is_current(handle) {
            return;
        }
        let entry = self.segment.reader(handle.index);
        entry.acked_seq.fetch_max(seq, Ordering::AcqRel);
        entry.heartbeat_ns.store(monotonic_ns(), Ordering::Release);
        futex::signal(&self.segment.header().release_signal);
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }

        let handle = *self.reader.lock();
        let detached = {
            let guard = self.segment.lock();
            self.segment.detach_reader(&guard, handle)
        };
        if detached {
            futex::signal(&self.segment.header().release_signal);
            log::debug!("source detached from channel '{}'", self.name());
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_source(self, f)
    }
}

impl Heartbeat {
    fn spawn(
        segment: &Arc<Segment>,
        reader: &Arc<Mutex<ReaderHandle>>,
        period: Duration,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let segment = Arc::clone(segment);
            let reader = Arc::clone(reader);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("shmflow-hb-{}", segment.channel()))
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        let handle = *reader.lock();
                        if segment.reader_is_current(handle) {
                            segment
                                .reader(handle.index)
                                .heartbeat_ns
                                .store(monotonic_ns(), Ordering::Release);
                        }
                        thread::park_timeout(period);
                    }
                })?
        };
        Ok(Self { stop, thread })
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Release);
        self.thread.thread().unpark();
        let _ = self.thread.join();
    }
}

impl<'a> ReadableSlot<'a> {
    /// The sample's payload, read in place.
    pub fn bytes(&self) -> &[u8] {
        self.source.segment.payload(self.index, self.len)
    }

    pub fn sequence(&self) -> u64 {
        self.seq
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Acknowledge the sample so the Sink may reuse its slot.
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for ReadableSlot<'_> {
    fn drop(&mut self) {
        self.source.acknowledge(self.seq);
    }
}

impl fmt::Debug for ReadableSlot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableSlot")
            .field("channel", &self.source.name())
            .field("sequence", &self.seq)
            .field("len", &self.len)
            .finish()
    }
}
