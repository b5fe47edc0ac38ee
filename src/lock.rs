//! Advisory file locks and atomic writes under the data root.
//!
//! Repository locks are named by [`LockKey`] and must be taken in key
//! order: a land lock, then a view lock, then the trunk lock. State tables
//! are guarded by a `<file>.lock` sibling taken last and held briefly.
//!
//! fs2 locks belong to the open file description, so two threads of one
//! process exclude each other the same way two processes do.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tempfile::NamedTempFile;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Default lock timeout in milliseconds
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Repository lock names within one codebase, listed in acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockKey {
    /// Serializes lands of one workspace
    Land(String),
    /// A durable or temporary view
    View(String),
    /// Ref updates on the trunk repository
    Trunk,
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Land(workspace_id) => write!(f, "land-{workspace_id}"),
            LockKey::View(view_id) => write!(f, "view-{view_id}"),
            LockKey::Trunk => f.write_str("trunk"),
        }
    }
}

/// Exclusive lock released on drop
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Wait up to `timeout_ms` for an exclusive lock on `path`, creating the
    /// lock file and its parent directories if needed.
    pub fn acquire(path: impl AsRef<Path>, timeout_ms: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = open(path)?;
        let started = Instant::now();
        let deadline = started + Duration::from_millis(timeout_ms);

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    trace!(lock = %path.display(), waited_ms = started.elapsed().as_millis() as u64, "lock acquired");
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if contended(&err) => {
                    if Instant::now() >= deadline {
                        debug!(lock = %path.display(), timeout_ms, "lock timed out");
                        return Err(Error::LockFailed(path.to_path_buf()));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// `Ok(None)` when someone else holds the lock.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let file = open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(err) if contended(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            debug!(lock = %self.path.display(), error = %err, "unlock failed");
        }
    }
}

fn open(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

fn contended(err: &io::Error) -> bool {
    // Windows reports a held lock as a sharing or lock violation
    err.kind() == io::ErrorKind::WouldBlock
        || (cfg!(windows) && matches!(err.raw_os_error(), Some(32) | Some(33)))
}

/// Replace `path` with `data` through a synced sibling temp file.
///
/// Readers see the old or the new contents, never a mix. Writers must
/// coordinate through the file's lock.
pub fn write_atomic(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| Error::Io(err.error))?;
    Ok(())
}

/// Lock file guarding a state table (`<path>.lock`)
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}
