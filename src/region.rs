//! Named cross-process memory segment.
//!
//! A region is a file under a shared-memory directory (`/dev/shm` on Linux)
//! mapped read/write with memmap2. Every attached handle holds a shared
//! `flock` on the segment; `unlink` upgrades it to an exclusive lock first,
//! so destroying a segment that another process still has attached fails
//! with [`Error::RegionBusy`] instead of silently succeeding.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU32;

use log::{debug, info, warn};
use memmap2::MmapMut;

use crate::error::{Error, Result};

pub const DEFAULT_REGION_DIR: &str = "/dev/shm";
pub const DEFAULT_REGION_NAME: &str = "emulator_shared_mem";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Open,
    Closed,
    Unlinked,
}

pub struct SharedRegion {
    name: String,
    path: PathBuf,
    // kept after close() so unlink() can still check for other holders
    file: Option<File>,
    map: Option<MmapMut>,
    size: u64,
    state: RegionState,
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("size", &self.size)
            .field("state", &self.state)
            .finish()
    }
}

impl SharedRegion {
    /// Attach to an existing segment `name` inside `dir`.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        validate_name(name)?;
        let path = dir.join(name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| open_error(name, e))?;

        let size = file.metadata().map_err(|e| open_error(name, e))?.len();
        if size == 0 {
            return Err(Error::RegionTooSmall { name: name.to_string(), size, needed: 1 });
        }

        lock_shared(&file).map_err(|e| match e.kind() {
            ErrorKind::WouldBlock => Error::RegionBusy(name.to_string()),
            _ => Error::unexpected("locking shared region", e),
        })?;

        // SAFETY: the mapping is only accessed through atomics or while this
        // handle is open; other processes may write concurrently.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| open_error(name, e))?;

        info!("Attached shared region {} ({} bytes) at {}", name, size, path.display());
        Ok(Self {
            name: name.to_string(),
            path,
            file: Some(file),
            map: Some(map),
            size,
            state: RegionState::Open,
        })
    }

    /// Create a zero-filled segment and attach to it. This is the producer
    /// side of the protocol; a session only ever calls [`SharedRegion::open`].
    pub fn create(dir: &Path, name: &str, size: u64) -> Result<Self> {
        validate_name(name)?;
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| open_error(name, e))?;
        file.set_len(size)?;
        drop(file);
        debug!("Created shared region {} ({} bytes)", name, size);
        Self::open(dir, name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn state(&self) -> RegionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == RegionState::Open
    }

    pub fn bytes(&self) -> Result<&[u8]> {
        match &self.map {
            Some(map) => Ok(&map[..]),
            None => Err(Error::RegionClosed(self.name.clone())),
        }
    }

    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.map {
            Some(map) => Ok(&mut map[..]),
            None => Err(Error::RegionClosed(self.name.clone())),
        }
    }

    /// View the mapping as 32-bit atomic words (trailing bytes are ignored).
    pub fn words(&self) -> Result<&[AtomicU32]> {
        let map = self.map.as_ref().ok_or_else(|| Error::RegionClosed(self.name.clone()))?;
        let len = map.len() / std::mem::size_of::<AtomicU32>();
        // SAFETY: mappings are page aligned, AtomicU32 has the layout of u32,
        // and the slice borrows `self` so it cannot outlive the mapping.
        Ok(unsafe { std::slice::from_raw_parts(map.as_ptr() as *const AtomicU32, len) })
    }

    /// Detach this process's view. The segment itself stays alive.
    pub fn close(&mut self) {
        if self.state != RegionState::Open {
            return;
        }
        if let Some(map) = self.map.take()
            && let Err(e) = map.flush()
        {
            warn!("Flushing shared region {} failed: {}", self.name, e);
        }
        self.state = RegionState::Closed;
        debug!("Closed shared region {}", self.name);
    }

    /// Destroy the named segment for every process.
    pub fn unlink(&mut self) -> Result<()> {
        match self.state {
            RegionState::Unlinked => return Err(Error::AlreadyUnlinked(self.name.clone())),
            RegionState::Open => self.close(),
            RegionState::Closed => {}
        }

        if let Some(file) = &self.file
            && let Err(e) = lock_exclusive(file)
        {
            // flock conversion may have dropped our shared lock; take it back
            if let Err(relock) = lock_shared(file) {
                warn!("Re-locking shared region {} failed: {}", self.name, relock);
            }
            return Err(match e.kind() {
                ErrorKind::WouldBlock => Error::RegionBusy(self.name.clone()),
                _ => Error::unexpected("locking shared region for unlink", e),
            });
        }

        let removed = std::fs::remove_file(&self.path);
        self.file = None;
        self.state = RegionState::Unlinked;
        match removed {
            Ok(()) => {
                info!("Unlinked shared region {}", self.name);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound(self.name.clone())),
            Err(e) => Err(open_error(&self.name, e)),
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidRegionName(name.to_string()));
    }
    Ok(())
}

fn open_error(name: &str, e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::NotFound => Error::NotFound(name.to_string()),
        ErrorKind::PermissionDenied => Error::AccessDenied { name: name.to_string(), source: e },
        _ => Error::unexpected(&format!("opening shared region {name}"), e),
    }
}

#[cfg(unix)]
fn flock(file: &File, op: libc::c_int) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn lock_shared(file: &File) -> std::io::Result<()> {
    flock(file, libc::LOCK_SH)
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> std::io::Result<()> {
    flock(file, libc::LOCK_EX)
}

#[cfg(not(unix))]
fn lock_shared(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}
