// Process identity and liveness probes

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static INVOCATIONS: AtomicU64 = AtomicU64::new(0);

pub fn current_pid() -> u32 {
    std::process::id()
}

#[cfg(unix)]
pub fn current_uid() -> u32 {
    unsafe { libc::getuid() as u32 }
}

#[cfg(not(unix))]
pub fn current_uid() -> u32 {
    0
}

/// Non-invasive existence check: `kill(pid, 0)`.
///
/// Pid 0 means "not recorded" and counts as alive. EPERM means the process
/// exists but belongs to someone else.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return true;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

/// A fresh broker generation id.
///
/// Hashes pid, wall clock and a per-process counter so two brokers started
/// back to back in one process still differ. Never zero.
pub fn invocation_code(station: &str) -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    let mut hasher = Sha256::new();
    hasher.update(current_pid().to_le_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(INVOCATIONS.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    hasher.update(station.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes).max(1)
}
