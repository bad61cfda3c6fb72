use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use fs2::FileExt;

use crate::error::BuildError;

/// Per-device claim locks shared by every vmbuild process on the host.
///
/// Scanning sysfs only tells whether a device is attached *now*; two builds
/// scanning at the same time would both pick the same node. Holding an
/// exclusive lock on `<dir>/vmbuild-<dev>.lock` from the scan until the
/// device is detached serializes the claim.
#[derive(Debug, Clone)]
pub struct DeviceLocks {
    dir: PathBuf,
}

impl DeviceLocks {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn lock_path(&self, device: &Path) -> PathBuf {
        let name = device
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| device.to_string_lossy().replace('/', "_"));
        self.dir.join(format!("vmbuild-{}.lock", name))
    }

    /// Try to take the lock for `device` without blocking.
    ///
    /// Returns `Ok(None)` when another holder owns it. Lock files are never
    /// unlinked: removing a file someone still holds would let a third party
    /// lock a fresh inode at the same path.
    pub fn try_claim(&self, device: &Path) -> Result<Option<DeviceLock>, BuildError> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            BuildError::io(format!("Failed to create lock dir {}", self.dir.display()), e)
        })?;

        let path = self.lock_path(device);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| BuildError::io(format!("Failed to open lock file {}", path.display()), e))?;

        if !lock_acquired(&path, file.try_lock_exclusive())? {
            log::debug!("{} is locked by another build", device.display());
            return Ok(None);
        }

        log::trace!("Locked {}", path.display());
        Ok(Some(DeviceLock { file, path }))
    }
}

/// Contention means "try the next device"; any other failure is reported.
fn lock_acquired(path: &Path, result: io::Result<()>) -> Result<bool, BuildError> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(false),
        Err(e) => Err(BuildError::io(format!("Failed to lock {}", path.display()), e)),
    }
}

/// An exclusive claim on one device node; released on drop.
#[derive(Debug)]
pub struct DeviceLock {
    file: File,
    path: PathBuf,
}

impl DeviceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            log::warn!("Failed to unlock {}: {}", self.path.display(), err);
        }
    }
}
