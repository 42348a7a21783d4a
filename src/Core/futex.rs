use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

// The futex words live in a MAP_SHARED segment, so none of these calls may use
// FUTEX_PRIVATE_FLAG: waiters and wakers are in different processes.

/// Block while `atomic == expected`, for at most `timeout`.
///
/// Returns early on a wake, a spurious wake-up, a signal, or when the value has
/// already moved. Callers always re-check their condition in a loop.
#[cfg(target_os = "linux")]
pub fn futex_wait(atomic: &AtomicU32, expected: u32, timeout: Duration) {
    use std::ptr;

    // Check condition first to avoid syscall if possible
    if atomic.load(Ordering::Acquire) != expected {
        return;
    }

    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };

    unsafe {
        libc::syscall(
            libc::SYS_futex,
            atomic as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
            ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Wake every process blocked on `atomic`.
#[cfg(target_os = "linux")]
pub fn futex_wake_all(atomic: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            atomic as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(atomic: &AtomicU32, expected: u32, timeout: Duration) {
    // Fallback for non-Linux: short sleep instead of a kernel wait queue
    if atomic.load(Ordering::Acquire) == expected {
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake_all(_atomic: &AtomicU32) {
    // No-op on non-Linux
}

/// Bump a signal word and wake everyone waiting on it.
#[inline]
pub fn signal(atomic: &AtomicU32) {
    atomic.fetch_add(1, Ordering::AcqRel);
    futex_wake_all(atomic);
}
