//! Network block device pool management.
//!
//! Device nodes (`/dev/nbdN`, `/dev/loopN`) are a host-global resource shared
//! with every other process. A device is considered free when the kernel
//! reports no owner for it *and* we can take its claim lock, see
//! [`DeviceLocks`].

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use chrono::{DateTime, Utc};
use regex::Regex;
use vmbuild_config::nbd::NbdConfig;

use super::lock::{DeviceLock, DeviceLocks};
use crate::{
    command::{run_checked, CommandRunner, Tool, ToolCommand},
    error::BuildError,
};

const NBD_NODE_REGEX: &str = r"^nbd(\d+)$";
const LOOP_NODE_REGEX: &str = r"^loop(\d+)$";

/// How often and how long to wait for a partition node to show up
const PARTITION_POLL_ATTEMPTS: u32 = 20;
const PARTITION_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// `/dev/nbdN` driven by qemu-nbd
    NetworkBlockDevice,
    /// `/dev/loopN`
    Loopback,
    /// A plain image file used as the whole disk
    RawFile,
    /// A device-mapper partition created by kpartx
    MappedPartition,
}

impl DeviceKind {
    fn node_regex(&self) -> Option<&'static str> {
        match self {
            DeviceKind::NetworkBlockDevice => Some(NBD_NODE_REGEX),
            DeviceKind::Loopback => Some(LOOP_NODE_REGEX),
            DeviceKind::RawFile | DeviceKind::MappedPartition => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceKind::NetworkBlockDevice => "nbd",
            DeviceKind::Loopback => "loop",
            DeviceKind::RawFile => "raw file",
            DeviceKind::MappedPartition => "mapped partition",
        };
        f.write_str(s)
    }
}

/// Read-only view of the host's block devices.
pub trait DeviceProbe: Send + Sync {
    /// Device nodes of `kind`, in numeric order.
    fn candidates(&self, kind: DeviceKind) -> Result<Vec<PathBuf>, BuildError>;

    /// Whether the kernel reports an owner (a connected qemu-nbd or a loop
    /// backing file) for `device`.
    fn has_owner(&self, kind: DeviceKind, device: &Path) -> bool;

    fn node_exists(&self, device: &Path) -> bool;

    /// Whether `/sys/module/<module>/parameters/<param>` exists
    fn module_param_exists(&self, module: &str, param: &str) -> bool;
}

/// [`DeviceProbe`] backed by the real `/dev` and `/sys`.
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    dev_dir: PathBuf,
    sys_dir: PathBuf,
}

impl SysfsProbe {
    pub fn new(dev_dir: PathBuf, sys_dir: PathBuf) -> Self {
        Self { dev_dir, sys_dir }
    }

    pub fn from_config(config: &NbdConfig) -> Self {
        Self::new(config.dev_dir.clone(), config.sys_dir.clone())
    }

    fn block_dir(&self, device: &Path) -> Option<PathBuf> {
        device
            .file_name()
            .map(|name| self.sys_dir.join("block").join(name))
    }
}

impl DeviceProbe for SysfsProbe {
    fn candidates(&self, kind: DeviceKind) -> Result<Vec<PathBuf>, BuildError> {
        let Some(pattern) = kind.node_regex() else {
            return Ok(Vec::new());
        };
        let re = Regex::new(pattern).map_err(|e| BuildError::Config(e.to_string()))?;

        let entries = fs::read_dir(&self.dev_dir).map_err(|e| {
            BuildError::io(format!("Failed to read {}", self.dev_dir.display()), e)
        })?;

        let mut found: Vec<(u32, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                BuildError::io(format!("Failed to read {}", self.dev_dir.display()), e)
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(caps) = re.captures(name) {
                if let Ok(n) = caps[1].parse::<u32>() {
                    found.push((n, entry.path()));
                }
            }
        }
        found.sort_by_key(|(n, _)| *n);
        log::trace!("{} candidates: {:?}", kind, found);
        Ok(found.into_iter().map(|(_, p)| p).collect())
    }

    fn has_owner(&self, kind: DeviceKind, device: &Path) -> bool {
        let Some(block) = self.block_dir(device) else {
            return false;
        };
        match kind {
            DeviceKind::NetworkBlockDevice => block.join("pid").exists(),
            DeviceKind::Loopback => block.join("loop").join("backing_file").exists(),
            DeviceKind::RawFile | DeviceKind::MappedPartition => false,
        }
    }

    fn node_exists(&self, device: &Path) -> bool {
        device.exists()
    }

    fn module_param_exists(&self, module: &str, param: &str) -> bool {
        self.sys_dir
            .join("module")
            .join(module)
            .join("parameters")
            .join(param)
            .exists()
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// A device node picked by [`NbdManager::find_available_device`], locked but
/// not yet attached.
#[derive(Debug)]
pub struct DeviceClaim {
    path: PathBuf,
    kind: DeviceKind,
    lock: DeviceLock,
}

impl DeviceClaim {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }
}

/// An nbd device with an image connected to it.
///
/// The claim lock is held until the device is detached. Dropping an attached
/// handle tries `qemu-nbd -d` and logs the outcome; call [`detach`](Self::detach)
/// to observe errors.
pub struct DeviceHandle {
    path: PathBuf,
    kind: DeviceKind,
    image: PathBuf,
    claimed_at: DateTime<Utc>,
    lock: Option<DeviceLock>,
    attached: bool,
    detach_on_drop: bool,
    runner: Arc<dyn CommandRunner>,
}

impl DeviceHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn claimed_at(&self) -> DateTime<Utc> {
        self.claimed_at
    }

    pub fn attached(&self) -> bool {
        self.attached
    }

    /// `<device>p<nth>`, the node the kernel creates for partition `nth`
    pub fn partition_path(&self, nth: u8) -> PathBuf {
        PathBuf::from(format!("{}p{}", self.path.display(), nth))
    }

    pub fn detach(&mut self) -> Result<(), BuildError> {
        if !self.attached {
            return Err(BuildError::NotActive {
                resource: format!("device {}", self.path.display()),
            });
        }
        disconnect(self.runner.as_ref(), &self.path)?;
        self.attached = false;
        self.lock = None;
        log::info!("Detached {} from {}", self.image.display(), self.path.display());
        Ok(())
    }

    /// Leave the device attached when this handle is dropped. Used when the
    /// filesystem on it could not be unmounted.
    pub fn keep_attached(&mut self) {
        self.detach_on_drop = false;
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("image", &self.image)
            .field("claimed_at", &self.claimed_at)
            .field("attached", &self.attached)
            .finish()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if !self.attached {
            return;
        }
        if !self.detach_on_drop {
            log::warn!(
                "Leaving {} attached to {}, detach it with `vmbuild nbd detach {}`",
                self.image.display(),
                self.path.display(),
                self.path.display()
            );
            return;
        }
        if let Err(e) = self.detach() {
            log::error!("Failed to detach {} on drop: {}", self.path.display(), e);
        }
    }
}

fn disconnect(runner: &dyn CommandRunner, device: &Path) -> Result<(), BuildError> {
    let mut cmd = ToolCommand::new(Tool::QemuNbd);
    cmd.arg("-d").arg(device);
    run_checked(runner, &cmd, |reason| BuildError::DetachFailed {
        device: device.to_path_buf(),
        reason,
    })?;
    Ok(())
}

/// Claims nbd devices and connects images to them.
pub struct NbdManager {
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn DeviceProbe>,
    sleeper: Arc<dyn Sleeper>,
    locks: DeviceLocks,
    config: NbdConfig,
}

impl NbdManager {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn DeviceProbe>,
        sleeper: Arc<dyn Sleeper>,
        config: NbdConfig,
    ) -> Self {
        let locks = DeviceLocks::new(config.lock_dir.clone());
        Self {
            runner,
            probe,
            sleeper,
            locks,
            config,
        }
    }

    /// Load the nbd kernel module and check that it is usable.
    pub fn ensure_module_loaded(&self) -> Result<(), BuildError> {
        let mut cmd = ToolCommand::new(Tool::Modprobe);
        cmd.arg("nbd")
            .arg(format!("max_part={}", self.config.max_part));
        run_checked(self.runner.as_ref(), &cmd, |reason| {
            BuildError::Environment(format!("modprobe nbd failed: {}", reason))
        })?;
        self.ready()
    }

    /// Check `lsmod` lists the nbd module.
    pub fn ready(&self) -> Result<(), BuildError> {
        let output = run_checked(self.runner.as_ref(), &ToolCommand::new(Tool::Lsmod), |reason| {
            BuildError::Environment(format!("lsmod failed: {}", reason))
        })?;

        let loaded = output
            .stdout
            .lines()
            .any(|line| line.split_whitespace().next() == Some("nbd"));
        if !loaded {
            return Err(BuildError::Environment(
                "nbd kernel module is not loaded".to_string(),
            ));
        }

        if !self.probe.module_param_exists("nbd", "max_part") {
            log::warn!(
                "nbd module has no max_part parameter, partitions on nbd devices may not appear"
            );
        }
        Ok(())
    }

    /// Scan the pool once and claim the first free device of `kind`.
    pub fn find_available_device(&self, kind: DeviceKind) -> Result<DeviceClaim, BuildError> {
        for candidate in self.probe.candidates(kind)? {
            if self.probe.has_owner(kind, &candidate) {
                log::trace!("{} is in use", candidate.display());
                continue;
            }
            let Some(lock) = self.locks.try_claim(&candidate)? else {
                continue;
            };
            // someone may have attached between the scan and the lock
            if self.probe.has_owner(kind, &candidate) {
                log::trace!("{} was taken while locking", candidate.display());
                continue;
            }
            log::debug!("Claimed {} ({})", candidate.display(), lock.path().display());
            return Ok(DeviceClaim {
                path: candidate,
                kind,
                lock,
            });
        }
        Err(BuildError::NoDeviceAvailable { kind, attempts: 1 })
    }

    /// Connect `image` to a free nbd device, waiting for one if the pool is
    /// exhausted.
    pub fn attach_image(&self, image: &Path) -> Result<DeviceHandle, BuildError> {
        let kind = DeviceKind::NetworkBlockDevice;
        let attempts = self.config.connect_retries.max(1);

        let mut claim = None;
        for attempt in 1..=attempts {
            match self.find_available_device(kind) {
                Ok(c) => {
                    claim = Some(c);
                    break;
                }
                Err(BuildError::NoDeviceAvailable { .. }) if attempt < attempts => {
                    log::warn!(
                        "No free {} device (attempt {}/{}), retrying in {}",
                        kind,
                        attempt,
                        attempts,
                        humantime::format_duration(self.config.retry_backoff)
                    );
                    self.sleeper.sleep(self.config.retry_backoff);
                }
                Err(BuildError::NoDeviceAvailable { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        let claim = claim.ok_or(BuildError::NoDeviceAvailable { kind, attempts })?;

        let mut cmd = ToolCommand::new(Tool::QemuNbd);
        cmd.arg("-c").arg(claim.path()).arg(image);
        run_checked(self.runner.as_ref(), &cmd, |reason| BuildError::AttachFailed {
            device: claim.path().to_path_buf(),
            image: image.to_path_buf(),
            reason,
        })?;

        log::info!("Attached {} to {}", image.display(), claim.path().display());
        Ok(DeviceHandle {
            path: claim.path,
            kind: claim.kind,
            image: image.to_path_buf(),
            claimed_at: Utc::now(),
            lock: Some(claim.lock),
            attached: true,
            detach_on_drop: true,
            runner: self.runner.clone(),
        })
    }

    /// Disconnect whatever is attached to `device`, for devices no handle
    /// owns any more (e.g. left behind by a crashed build).
    pub fn detach_device(&self, device: &Path) -> Result<(), BuildError> {
        disconnect(self.runner.as_ref(), device)?;
        log::info!("Detached {}", device.display());
        Ok(())
    }

    /// Wait for the kernel to create the node of partition `nth` on `device`.
    pub fn wait_for_partition(&self, device: &DeviceHandle, nth: u8) -> Result<PathBuf, BuildError> {
        let part = device.partition_path(nth);
        for _ in 0..PARTITION_POLL_ATTEMPTS {
            if self.probe.node_exists(&part) {
                return Ok(part);
            }
            self.sleeper.sleep(PARTITION_POLL_INTERVAL);
        }
        Err(BuildError::PartitionFailed {
            device: device.path().to_path_buf(),
            reason: format!("partition node {} did not appear", part.display()),
        })
    }
}
