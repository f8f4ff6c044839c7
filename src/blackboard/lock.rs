use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Retry interval while waiting for a contended lock.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default wall-clock budget for acquiring a lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock timeout ({:.0}s): {}", timeout.as_secs_f64(), path.display())]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("Lock I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An open file holding an advisory OS lock. The lock is released when the
/// guard is dropped, on every exit path.
///
/// Acquisition polls `try_lock_*` against a deadline instead of blocking, so
/// it works from any thread (no process-wide alarm signals) and cannot hang
/// past its budget even when another process wedges while holding the lock.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
}

impl LockedFile {
    /// Acquire an exclusive lock, creating the file (and parent directories)
    /// if absent. The file is opened read+write.
    pub fn exclusive(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let file = open_for_write(path, false)?;
        Self::acquire(file, path, timeout, true)
    }

    /// Acquire an exclusive lock with the file opened in append mode.
    pub fn exclusive_append(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let file = open_for_write(path, true)?;
        Self::acquire(file, path, timeout, true)
    }

    /// Acquire a shared lock for reading. Fails with `Io(NotFound)` if the
    /// file does not exist.
    pub fn shared(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let file = File::open(path).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::acquire(file, path, timeout, false)
    }

    fn acquire(
        file: File,
        path: &Path,
        timeout: Duration,
        exclusive: bool,
    ) -> Result<Self, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            let attempt = if exclusive {
                fs2::FileExt::try_lock_exclusive(&file)
            } else {
                fs2::FileExt::try_lock_shared(&file)
            };
            match attempt {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if is_contended(&e) => {
                    if Instant::now() >= deadline {
                        return Err(LockError::Timeout {
                            path: path.to_path_buf(),
                            timeout,
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(source) => {
                    return Err(LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole file from the start.
    pub fn read_to_string(&mut self) -> io::Result<String> {
        use std::io::{Read, Seek, SeekFrom};
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = String::new();
        self.file.read_to_string(&mut buf)?;
        Ok(buf)
    }

    /// Replace the file contents (seek to start, write, truncate).
    pub fn overwrite(&mut self, content: &str) -> io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(content.as_bytes())?;
        self.file.set_len(content.len() as u64)?;
        self.file.flush()
    }

    /// Append to the end of the file.
    pub fn append(&mut self, content: &str) -> io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(content.as_bytes())?;
        self.file.flush()
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EAGAIN)
}

fn open_for_write(path: &Path, append: bool) -> Result<File, LockError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    OpenOptions::new()
        .read(true)
        .write(!append)
        .append(append)
        .create(true)
        .open(path)
        .map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })
}
