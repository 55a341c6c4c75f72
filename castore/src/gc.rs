use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use tracing::warn;

/// Shared side of the process-wide garbage-collection lock.
///
/// Every request holds a shared lock for its entire duration; the external
/// garbage collector takes the exclusive side. Acquisition is non-blocking,
/// so a running collector is signalled by acquisition failure. The lock is
/// released when the guard is dropped.
#[derive(Debug)]
pub struct GcLock {
    _file: File,
}

pub struct GarbageCollector;

impl GarbageCollector {
    const LOCK_FILE: &'static str = "gc.lock";

    /// Tries to take the shared side of the lock under the given storage
    /// root. `None` means the collector currently holds the exclusive side
    /// (or the lock file is not creatable).
    pub fn shared_lock(storage_root: &Path) -> Option<GcLock> {
        let path = storage_root.join(Self::LOCK_FILE);
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %path.display(), %err, "opening gc lock file failed");
                return None;
            }
        };

        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_SH | libc::LOCK_NB) };
        if ret != 0 {
            warn!(path = %path.display(), "gc lock is held exclusively");
            return None;
        }
        Some(GcLock { _file: file })
    }
}
