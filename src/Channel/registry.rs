use super::Structs::Descriptor_Structs::PayloadDescriptor;
use crate::Core::segment::Segment;
use crate::Core::SharedMemory;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "shmflow";

const MAX_NAME_LEN: usize = 64;

/// An object still uninitialised after this long was abandoned by its creator.
pub const INIT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Resolves channel names to shared memory segments.
///
/// One registry per process is the norm; tests build one per case with a unique
/// namespace so they never see each other's channels. Cloning is cheap and clones
/// share the set of names this process is sinking.
#[derive(Clone, Debug)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    namespace: String,
    sinking: Mutex<HashSet<String>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                namespace: DEFAULT_NAMESPACE.to_owned(),
                sinking: Mutex::new(HashSet::new()),
            }),
        }
    }
}

impl Registry {
    pub fn new(namespace: &str) -> Result<Self> {
        validate_name(namespace)?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                namespace: namespace.to_owned(),
                sinking: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Host-wide shm object name for `channel`.
    pub fn object_name(&self, channel: &str) -> String {
        format!("{}.{}", self.inner.namespace, channel)
    }

    /// Allocate the segment for a new Sink.
    ///
    /// A leftover object whose Sink process is gone (or that is unreadable) is
    /// reclaimed; one owned by a live process is `NameInUse`. So is one that is
    /// still uninitialised, until it is older than [`INIT_GRACE_PERIOD`].
    pub(crate) fn allocate(
        &self,
        channel: &str,
        descriptor: &PayloadDescriptor,
        slot_count: usize,
        reader_liveness: Duration,
    ) -> Result<Segment> {
        validate_name(channel)?;
        let object = self.object_name(channel);
        let in_use = || Error::NameInUse {
            name: channel.to_owned(),
        };

        let mut sinking = self.inner.sinking.lock();
        if sinking.contains(channel) {
            return Err(in_use());
        }

        let mut reclaimed = false;
        loop {
            match Segment::allocate(&object, channel, descriptor, slot_count, reader_liveness) {
                Ok(segment) => {
                    sinking.insert(channel.to_owned());
                    return Ok(segment);
                }
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists && !reclaimed => {
                    match Segment::open(&object, channel) {
                        Ok(existing) if existing.sink_alive() => return Err(in_use()),
                        // Someone is still initialising it
                        Err(Error::NotFound { .. }) if !initialisation_abandoned(&object) => {
                            return Err(in_use())
                        }
                        Ok(_) | Err(_) => {
                            log::warn!("reclaiming stale segment for channel '{}'", channel);
                            match SharedMemory::unlink_shared_memory(&object) {
                                Ok(()) => {}
                                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                                Err(e) => return Err(e.into()),
                            }
                            reclaimed = true;
                        }
                    }
                }
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(in_use())
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Forget a Sink's channel and unlink its object. Attached Sources keep their mapping.
    pub(crate) fn release(&self, channel: &str) {
        self.inner.sinking.lock().remove(channel);
        match SharedMemory::unlink_shared_memory(&self.object_name(channel)) {
            Ok(()) => log::debug!("unlinked channel '{}'", channel),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("failed to unlink channel '{}': {}", channel, e),
        }
    }

    /// One connect attempt. A segment left behind by a dead Sink counts as absent.
    pub(crate) fn open(&self, channel: &str) -> Result<Segment> {
        validate_name(channel)?;
        let segment = Segment::open(&self.object_name(channel), channel)?;
        if !segment.sink_alive() {
            log::debug!("ignoring stale segment for channel '{}'", channel);
            return Err(Error::NotFound {
                name: channel.to_owned(),
            });
        }
        Ok(segment)
    }

    /// Channel names currently present in this namespace, sorted.
    pub fn channels(&self) -> Vec<String> {
        let prefix = format!("{}.", self.inner.namespace);
        let dir = SharedMemory::shm_path("");
        let mut names: Vec<String> = match fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .filter_map(|name| name.strip_prefix(&prefix).map(str::to_owned))
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}

/// Whether an uninitialised object has sat untouched past the grace period.
fn initialisation_abandoned(object: &str) -> bool {
    fs::metadata(SharedMemory::shm_path(object))
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map_or(false, |age| age > INIT_GRACE_PERIOD)
}

/// Channel names are short operator tokens: `[A-Za-z0-9_-]{1,64}`.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |message: &str| Error::InvalidName {
        name: name.to_owned(),
        message: message.to_owned(),
    };
    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("longer than 64 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(invalid("only letters, digits, '_' and '-' are allowed"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_short_tokens() {
        assert!(validate_name("raw").is_ok());
        assert!(validate_name("rpos_2-a").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a.b").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn object_names_are_namespaced() {
        let reg = Registry::new("unit").unwrap();
        assert_eq!(reg.object_name("raw"), "unit.raw");
        assert_eq!(Registry::default().namespace(), DEFAULT_NAMESPACE);
        assert!(Registry::new("bad ns").is_err());
    }
}
