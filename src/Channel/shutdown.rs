use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

lazy_static! {
    static ref PROCESS_SHUTDOWN: Shutdown = Shutdown::new();
    static ref HANDLER_INSTALLED: Mutex<bool> = Mutex::new(false);
}

/// Cooperative cancellation flag shared by a stage's processing and control loops.
///
/// Blocking channel calls check it once per wait slice and return `Error::Interrupted`.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide flag, with a Ctrl-C handler that raises it.
    /// Safe to call more than once; the handler is installed on the first call.
    pub fn install() -> io::Result<Self> {
        let mut installed = HANDLER_INSTALLED.lock();
        if !*installed {
            let flag = PROCESS_SHUTDOWN.clone();
            ctrlc::set_handler(move || flag.trigger())
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            *installed = true;
        }
        Ok(PROCESS_SHUTDOWN.clone())
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let a = Shutdown::new();
        let b = a.clone();
        assert!(!b.is_triggered());
        a.trigger();
        assert!(b.is_triggered());
    }

    #[test]
    fn install_is_idempotent() {
        let a = Shutdown::install().unwrap();
        let b = Shutdown::install().unwrap();
        assert!(Arc::ptr_eq(&a.flag, &b.flag));
    }
}
