//! File-backed state store shared between processes.
//!
//! Each namespace is one JSON object on disk (`<state_dir>/<namespace>.json`).
//! Every access takes a `flock` on that file, exclusive for mutations and
//! shared for reads, so concurrent processes see a consistent document.
//! Locks are polled non-blocking up to a deadline; a holder that never lets
//! go surfaces as [`StoreError::LockTimeout`].

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::store::{StateStore, StoreError, StoreResult};

/// Default bound on waiting for another holder's file lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const LOCK_POLL_MIN: Duration = Duration::from_millis(2);
const LOCK_POLL_MAX: Duration = Duration::from_millis(50);

/// State store persisting one JSON document per namespace.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl FileStore {
    /// Create a store rooted at `dir`. The directory is created lazily.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Path of the document backing a namespace.
    pub fn namespace_path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.json"))
    }

    fn io_err(path: &Path, source: io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn open_locked(&self, namespace: &str, exclusive: bool) -> StoreResult<(File, PathBuf)> {
        let path = self.namespace_path(namespace);
        fs::create_dir_all(&self.dir).map_err(|e| Self::io_err(&self.dir, e))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Self::io_err(&path, e))?;
        match lock(&file, exclusive, self.lock_timeout) {
            Ok(()) => Ok((file, path)),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(StoreError::LockTimeout {
                path,
                waited_ms: self.lock_timeout.as_millis() as u64,
            }),
            Err(e) => Err(Self::io_err(&path, e)),
        }
    }

    fn with_document<R>(
        &self,
        namespace: &str,
        f: impl FnOnce(&mut Map<String, Value>) -> (bool, R),
    ) -> StoreResult<R> {
        let (mut file, path) = self.open_locked(namespace, true)?;
        let mut document = read_document(&mut file).map_err(|e| Self::io_err(&path, e))?;
        let (dirty, output) = f(&mut document);
        if dirty {
            write_document(&mut file, &document).map_err(|e| Self::io_err(&path, e))?;
        }
        // Dropping the handle releases the lock.
        Ok(output)
    }
}

impl StateStore for FileStore {
    fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<Value>> {
        let path = self.namespace_path(namespace);
        if !path.exists() {
            return Ok(None);
        }
        let (mut file, path) = self.open_locked(namespace, false)?;
        let document = read_document(&mut file).map_err(|e| Self::io_err(&path, e))?;
        Ok(document.get(key).cloned())
    }

    fn mutate(
        &self,
        namespace: &str,
        key: &str,
        f: &mut dyn FnMut(&mut Option<Value>),
    ) -> StoreResult<()> {
        self.with_document(namespace, |document| {
            let before = document.get(key).cloned();
            let mut slot = before.clone();
            f(&mut slot);
            let dirty = slot != before;
            match slot {
                Some(value) => {
                    document.insert(key.to_string(), value);
                }
                None => {
                    document.remove(key);
                }
            }
            (dirty, ())
        })
    }

    fn scan(&self, namespace: &str) -> StoreResult<Vec<(String, Value)>> {
        let path = self.namespace_path(namespace);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let (mut file, path) = self.open_locked(namespace, false)?;
        let document = read_document(&mut file).map_err(|e| Self::io_err(&path, e))?;
        Ok(document.into_iter().collect())
    }

    fn retain(
        &self,
        namespace: &str,
        keep: &mut dyn FnMut(&str, &Value) -> bool,
    ) -> StoreResult<()> {
        self.with_document(namespace, |document| {
            let before = document.len();
            document.retain(|key, value| keep(key, value));
            (document.len() != before, ())
        })
    }
}

fn read_document(file: &mut File) -> io::Result<Map<String, Value>> {
    file.seek(SeekFrom::Start(0))?;
    let mut raw = String::new();
    file.read_to_string(&mut raw)?;
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) | Err(_) => {
            tracing::warn!("Discarding unreadable state document");
            Ok(Map::new())
        }
    }
}

fn write_document(file: &mut File, document: &Map<String, Value>) -> io::Result<()> {
    let encoded = serde_json::to_vec(document).map_err(io::Error::other)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&encoded)?;
    file.flush()?;
    file.sync_all()
}

/// Take a `flock` on the file, giving up with `TimedOut` after `timeout`.
/// Released when the handle closes.
pub(crate) fn lock(file: &File, exclusive: bool, timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    let mut pause = LOCK_POLL_MIN;
    loop {
        if try_lock(file, exclusive)? {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("file lock not acquired within {}ms", timeout.as_millis()),
            ));
        }
        std::thread::sleep(pause.min(deadline - now));
        pause = (pause * 2).min(LOCK_POLL_MAX);
    }
}

/// One non-blocking `flock` attempt. `Ok(false)` means another holder has it.
#[cfg(unix)]
#[allow(unsafe_code)]
fn try_lock(file: &File, exclusive: bool) -> io::Result<bool> {
    let fd = file.as_raw_fd();
    let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
    // SAFETY: `fd` comes from a live `File` borrowed for the duration of the
    // call, and LOCK_EX / LOCK_SH with LOCK_NB are valid flock operations.
    let rc = unsafe { libc::flock(fd, op | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

#[cfg(not(unix))]
fn try_lock(_: &File, _: bool) -> io::Result<bool> {
    Ok(true)
}
