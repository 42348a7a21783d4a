use super::shutdown::Shutdown;
use super::Structs::Descriptor_Structs::DescriptorExpectation;
use crate::Core::segment::layout::{MAX_READERS, MAX_SLOTS, MIN_SLOTS};
use crate::error::{Error, Result};
use std::time::Duration;

pub const DEFAULT_SLOT_COUNT: usize = 3;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READER_LIVENESS_TIMEOUT: Duration = Duration::from_secs(2);

/// Options shared by Sink creation and Source connection.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Ring size (Sink)
    pub slot_count: usize,
    /// How long `Source::connect` retries before giving up
    pub connect_timeout: Duration,
    /// Heartbeat age after which the Sink treats a reader as dead (Sink).
    /// The Sink advertises it in the segment; Sources heartbeat at a quarter of
    /// the advertised value whatever their own setting.
    pub reader_liveness_timeout: Duration,
    /// First publish waits until this many Sources are attached (Sink)
    pub expected_readers: usize,
    /// What a Source accepts at connect time
    pub expected: DescriptorExpectation,
    /// Interrupts blocking calls when triggered
    pub shutdown: Option<Shutdown>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            slot_count: DEFAULT_SLOT_COUNT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reader_liveness_timeout: DEFAULT_READER_LIVENESS_TIMEOUT,
            expected_readers: 0,
            expected: DescriptorExpectation::Any,
            shutdown: None,
        }
    }
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slot_count(mut self, slot_count: usize) -> Self {
        self.slot_count = slot_count;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reader_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.reader_liveness_timeout = timeout;
        self
    }

    pub fn with_expected_readers(mut self, readers: usize) -> Self {
        self.expected_readers = readers;
        self
    }

    pub fn with_expected(mut self, expected: DescriptorExpectation) -> Self {
        self.expected = expected;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_SLOTS..=MAX_SLOTS).contains(&self.slot_count) {
            return Err(Error::invalid_config(
                "slot_count",
                format!(
                    "must be between {} and {}, got {}",
                    MIN_SLOTS, MAX_SLOTS, self.slot_count
                ),
            ));
        }
        if self.reader_liveness_timeout.is_zero() {
            return Err(Error::invalid_config(
                "reader_liveness_timeout",
                "must be non-zero",
            ));
        }
        if self.expected_readers > MAX_READERS {
            return Err(Error::invalid_config(
                "expected_readers",
                format!("at most {} readers can attach", MAX_READERS),
            ));
        }
        Ok(())
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.shutdown.as_ref().map_or(false, Shutdown::is_triggered)
    }
}

/// Period of a Source's heartbeat thread for a Sink advertising `reader_liveness`.
pub(crate) fn heartbeat_period(reader_liveness: Duration) -> Duration {
    (reader_liveness / 4).max(Duration::from_millis(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ChannelConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.slot_count, DEFAULT_SLOT_COUNT);
        assert!(!cfg.interrupted());
    }

    #[test]
    fn rejects_single_slot_ring() {
        let err = ChannelConfig::new().with_slot_count(1).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
        assert!(ChannelConfig::new().with_slot_count(MAX_SLOTS + 1).validate().is_err());
    }

    #[test]
    fn heartbeat_runs_at_a_quarter_of_liveness() {
        assert_eq!(heartbeat_period(Duration::from_secs(2)), Duration::from_millis(500));
        assert_eq!(heartbeat_period(Duration::from_millis(8)), Duration::from_millis(5));
    }

    #[test]
    fn shutdown_flag_is_observed() {
        let stop = Shutdown::new();
        let cfg = ChannelConfig::new().with_shutdown(stop.clone());
        stop.trigger();
        assert!(cfg.interrupted());
    }
}
