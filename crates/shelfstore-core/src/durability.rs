//! Forcing file contents and renames to persistent storage.
//!
//! Maps to the strongest primitive each platform offers:
//! Linux `fdatasync`, Apple `F_FULLFSYNC`, Windows `FlushFileBuffers`,
//! and `File::sync_data` elsewhere.

use std::fs::File;
use std::io;
use std::path::Path;

use crate::config::SyncPolicy;

/// Block until `file`'s data is on persistent media.
///
/// The caller must not hold locks other writers need while this runs on
/// slow devices.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live `File` borrow.
        let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if result == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        // plain fsync stops at the drive's volatile cache on Apple platforms
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live `File` borrow.
        let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if result == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle comes from a live `File` borrow.
        let result = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        if result != 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Sync only when the policy asks for per-write durability.
pub fn sync_for_policy(file: &File, policy: SyncPolicy) -> io::Result<()> {
    match policy {
        SyncPolicy::Durable => durable_sync(file),
        SyncPolicy::Buffered => Ok(()),
    }
}

/// Persist a rename by syncing the directory that holds `path`.
pub fn sync_parent_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            let parent = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
            let dir = File::open(parent)?;
            return durable_sync(&dir);
        }
        Ok(())
    }

    // directories cannot be opened as files on Windows; rename durability
    // there comes from the file sync itself
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_durable_sync_success() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"test data for durable sync").unwrap();
        assert!(durable_sync(file.as_file()).is_ok());
        assert!(sync_for_policy(file.as_file(), SyncPolicy::Buffered).is_ok());
    }

    #[test]
    fn test_sync_parent_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("db.shelf");
        std::fs::write(&path, b"x").unwrap();
        assert!(sync_parent_dir(&path).is_ok());
    }
}
