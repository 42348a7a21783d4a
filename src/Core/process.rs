// Process liveness and a host-wide clock, both usable across process boundaries

/// Current process id as stored in shared headers.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Whether a process with this pid still exists on the host.
///
/// `kill(pid, 0)` performs the permission and existence checks without sending
/// anything. EPERM means the process exists but belongs to someone else.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    pid != 0
}

/// CLOCK_MONOTONIC in nanoseconds. Shared by every process on the host, so
/// heartbeats written by one process can be aged by another.
#[cfg(unix)]
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(not(unix))]
pub fn monotonic_ns() -> u64 {
    use std::time::Instant;
    lazy_static::lazy_static! {
        static ref ORIGIN: Instant = Instant::now();
    }
    ORIGIN.elapsed().as_nanos() as u64
}

/// Wall-clock time in nanoseconds since the Unix epoch, used for sample timestamps.
pub fn wall_clock_ns() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(current_pid()));
        assert!(!pid_alive(0));
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_ns();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(monotonic_ns() > a);
    }
}
