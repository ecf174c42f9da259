use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::Core::process;

/// Block while `atomic` still holds `expected`, for at most `timeout`.
///
/// The word may live in memory mapped by several processes, so the shared
/// (non-private) futex is used. Spurious returns are allowed; callers re-check.
#[cfg(target_os = "linux")]
pub fn futex_wait(atomic: &AtomicU32, expected: u32, timeout: Duration) {
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
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Wake every waiter blocked on `atomic`.
#[cfg(target_os = "linux")]
pub fn futex_wake(atomic: &AtomicU32) {
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
    // Fallback for non-Linux: short sleep, the caller polls
    if atomic.load(Ordering::Acquire) == expected {
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_atomic: &AtomicU32) {
    // No-op on non-Linux
}

/// Cross-process lock over one shared word.
///
/// The word holds the pid of the holder (0 when free). A holder that died
/// inside the critical section is detected on timeout and its lock taken over.
pub struct RegionLock<'a> {
    word: &'a AtomicU32,
}

impl<'a> RegionLock<'a> {
    const SPIN_WAIT: Duration = Duration::from_millis(1);

    /// Acquire the lock, giving up after `timeout`.
    pub fn acquire(word: &'a AtomicU32, timeout: Duration) -> Option<Self> {
        let me = process::current_pid().max(1);
        let deadline = Instant::now() + timeout;

        loop {
            match word.compare_exchange(0, me, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(Self { word }),
                Err(holder) => {
                    if holder != me && !process::process_alive(holder) {
                        // Take over from a dead holder
                        if word
                            .compare_exchange(holder, me, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            tracing::warn!(holder, "took over region lock from dead process");
                            return Some(Self { word });
                        }
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return None;
                    }
                    futex_wait(word, holder, Self::SPIN_WAIT);
                }
            }
        }
    }
}

impl Drop for RegionLock<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
        futex_wake(self.word);
    }
}
