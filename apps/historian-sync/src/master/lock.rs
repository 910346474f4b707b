use crate::error::MergeError;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Exclusive advisory lock on a unit's master, held for one read-merge-write cycle.
/// Another writer, in this process or another, gets `MergeError::Locked` instead of waiting.
#[derive(Debug)]
pub struct MasterLock {
    file: File,
    path: PathBuf,
}

impl MasterLock {
    pub fn try_acquire(path: &Path, unit: &str) -> Result<Self, MergeError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(MergeError::Locked {
                    unit: unit.to_string(),
                });
            }
            return Err(MergeError::Io(err));
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MasterLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
