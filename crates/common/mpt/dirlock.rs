use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::MptError;

const LOCK_FILE: &str = "forest.lock";

/// An exclusive lock keeping two forest instances from opening the same
/// directory.
///
/// The exclusion is an OS-level advisory lock (`flock` on unix) on the
/// `forest.lock` file, held through the open descriptor: when the owning
/// process exits or crashes, the kernel releases the lock and the directory
/// can be reopened without manual recovery. [`DirLock::force_acquire`]
/// remains as the recovery hammer for a lock file left behind by some other
/// locking discipline; the caller asserts no other instance is alive.
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    pub fn acquire(directory: &Path) -> Result<DirLock, MptError> {
        fs::create_dir_all(directory).map_err(MptError::from_io)?;
        let path = directory.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(MptError::from_io)?;
        match sys::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(MptError::Locked(directory.to_path_buf()));
            }
            Err(err) => return Err(MptError::from_io(err)),
        }
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        Ok(DirLock { file, path })
    }

    /// Removes an existing lock file and acquires a fresh one. A lock held
    /// by a live process still wins; a dead owner's lock is already gone.
    pub fn force_acquire(directory: &Path) -> Result<DirLock, MptError> {
        let path = directory.join(LOCK_FILE);
        if path.exists() {
            fs::remove_file(&path).map_err(MptError::from_io)?;
        }
        DirLock::acquire(directory)
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // the lock file itself stays behind; only the kernel lock is dropped
        if let Err(err) = sys::unlock(&self.file) {
            warn!(path = %self.path.display(), %err, "failed to release directory lock");
        }
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io::{Error, Result};
    use std::os::unix::io::AsRawFd;

    pub fn try_lock_exclusive(file: &File) -> Result<()> {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::last_os_error())
        }
    }

    pub fn unlock(file: &File) -> Result<()> {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::last_os_error())
        }
    }
}

// advisory file locking is wired up for unix only
#[cfg(not(unix))]
mod sys {
    use std::fs::File;
    use std::io::Result;

    pub fn try_lock_exclusive(_file: &File) -> Result<()> {
        Ok(())
    }

    pub fn unlock(_file: &File) -> Result<()> {
        Ok(())
    }
}
