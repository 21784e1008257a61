//! Cross-process guard for commands that modify the database.
//!
//! The engine's `RwLock` only orders threads of one process. `insert`,
//! `import` and `delete` therefore take an exclusive flock() on
//! `<base>/mmsearch.lock` and hold it until the command ends. Read-only
//! commands never lock.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

const LOCK_FILE_NAME: &str = "mmsearch.lock";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another mmsearch process is writing to {0}")]
    Busy(PathBuf),

    #[error("cannot open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("flock failed: {0}")]
    Flock(io::Error),
}

/// Exclusive writer access to one base directory, released on drop.
pub struct WriterLock {
    file: File,
    path: PathBuf,
}

impl WriterLock {
    /// Take the writer lock without waiting.
    pub fn acquire(base_path: &Path) -> Result<Self, LockError> {
        let path = base_path.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;

        flock(&file, Mode::Exclusive).map_err(|e| {
            if e.kind() == io::ErrorKind::WouldBlock {
                LockError::Busy(base_path.to_path_buf())
            } else {
                LockError::Flock(e)
            }
        })?;

        log::debug!("Writer lock taken: {}", path.display());
        Ok(Self { file, path })
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        // closing the descriptor releases it too
        let _ = flock(&self.file, Mode::Release);
        log::debug!("Writer lock released: {}", self.path.display());
    }
}

enum Mode {
    Exclusive,
    Release,
}

#[cfg(unix)]
fn flock(file: &File, mode: Mode) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let operation = match mode {
        Mode::Exclusive => libc::LOCK_EX | libc::LOCK_NB,
        Mode::Release => libc::LOCK_UN,
    };
    // EWOULDBLOCK maps to ErrorKind::WouldBlock
    match unsafe { libc::flock(file.as_raw_fd(), operation) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

#[cfg(not(unix))]
fn flock(_file: &File, _mode: Mode) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn test_second_writer_is_busy_until_release() {
        let dir = tempfile::tempdir().unwrap();

        let first = WriterLock::acquire(dir.path()).unwrap();
        assert!(matches!(
            WriterLock::acquire(dir.path()),
            Err(LockError::Busy(path)) if path == dir.path()
        ));

        drop(first);
        assert!(WriterLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_missing_base_directory() {
        let dir = tempfile::tempdir().unwrap();
        let result = WriterLock::acquire(&dir.path().join("gone"));
        assert!(matches!(result, Err(LockError::Open { .. })));
    }
}
