//! Persistence barriers for pool files
//!
//! A journal frame only counts as committed once it has reached media.
//! `persist` maps to the strongest data sync the platform offers, and
//! `persist_dir` makes file creation and rename survive power loss.

use std::fs::File;
use std::io;
use std::path::Path;

/// Block until everything written to `file` is on persistent media.
///
/// - Linux: `fdatasync()`; file data without timestamps
/// - macOS/iOS: `fcntl(F_FULLFSYNC)`; plain fsync stops at the drive cache there
/// - Other: `File::sync_data()`
///
/// May block for milliseconds under heavy I/O. Callers must not hold a lock
/// that the offload poller needs while calling this.
pub fn persist(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd comes from a live `File` borrow, so it is open for the
        // duration of the call.
        let rc = unsafe { libc::fdatasync(fd) };
        if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd comes from a live `File` borrow, so it is open for the
        // duration of the call.
        let rc = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
        if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
    {
        file.sync_data()
    }
}

/// Persist a directory entry so a freshly created or renamed pool file
/// is found again after a crash. No-op where directories cannot be opened.
pub fn persist_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        handle.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_persist_success() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"journal frame bytes").unwrap();

        let result = persist(file.as_file());
        assert!(result.is_ok(), "persist failed: {:?}", result.err());
    }

    #[test]
    fn test_persist_dir_success() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.pool"), b"x").unwrap();
        assert!(persist_dir(dir.path()).is_ok());
    }
}
