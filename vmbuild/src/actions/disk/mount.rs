use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    command::{run_checked, CommandRunner, Tool, ToolCommand},
    error::BuildError,
};

const MOUNT_DIR_PREFIX: &str = "vmbuild_mount_";

/// A mounted filesystem, unmounted on drop unless kept.
pub struct MountHandle {
    mount_point: PathBuf,
    device: PathBuf,
    mounted: bool,
    unmount_on_drop: bool,
    /// Whether the mount point was created for this mount and goes with it
    owns_dir: bool,
    runner: Arc<dyn CommandRunner>,
}

impl MountHandle {
    /// Mount `device` on a new `vmbuild_mount_*` directory under the system
    /// temp dir.
    pub fn mount(runner: Arc<dyn CommandRunner>, device: &Path) -> Result<Self, BuildError> {
        let mount_point = tempfile::Builder::new()
            .prefix(MOUNT_DIR_PREFIX)
            .tempdir()
            .map_err(|e| BuildError::io("Failed to create mount point", e))?
            .keep();

        let mut cmd = ToolCommand::new(Tool::Mount);
        cmd.arg(device).arg(&mount_point);
        if let Err(e) = run_checked(runner.as_ref(), &cmd, |reason| BuildError::MountFailed {
            device: device.to_path_buf(),
            mount_point: mount_point.clone(),
            reason,
        }) {
            remove_mount_dir(&mount_point);
            return Err(e);
        }

        log::info!("Mounted {} on {}", device.display(), mount_point.display());
        Ok(MountHandle {
            mount_point,
            device: device.to_path_buf(),
            mounted: true,
            unmount_on_drop: true,
            owns_dir: true,
            runner,
        })
    }

    /// `mount <options> <source> <mount_point>` on an existing directory,
    /// e.g. `-t proc none <root>/proc`. The directory stays after unmount.
    pub fn mount_at(
        runner: Arc<dyn CommandRunner>,
        source: &Path,
        mount_point: &Path,
        options: &[&str],
    ) -> Result<Self, BuildError> {
        let mut cmd = ToolCommand::new(Tool::Mount);
        cmd.args(options).arg(source).arg(mount_point);
        run_checked(runner.as_ref(), &cmd, |reason| BuildError::MountFailed {
            device: source.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            reason,
        })?;

        log::info!("Mounted {} on {}", source.display(), mount_point.display());
        Ok(MountHandle {
            mount_point: mount_point.to_path_buf(),
            device: source.to_path_buf(),
            mounted: true,
            unmount_on_drop: true,
            owns_dir: false,
            runner,
        })
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn mounted(&self) -> bool {
        self.mounted
    }

    /// Unmount, removing the mount point when it was created by [`mount`](Self::mount).
    pub fn unmount(&mut self) -> Result<(), BuildError> {
        if !self.mounted {
            return Err(BuildError::NotActive {
                resource: format!("mount {}", self.mount_point.display()),
            });
        }
        let mut cmd = ToolCommand::new(Tool::Umount);
        cmd.arg(&self.mount_point);
        run_checked(self.runner.as_ref(), &cmd, |reason| BuildError::UnmountFailed {
            mount_point: self.mount_point.clone(),
            reason,
        })?;
        self.mounted = false;
        log::info!("Unmounted {}", self.mount_point.display());
        if self.owns_dir {
            remove_mount_dir(&self.mount_point);
        }
        Ok(())
    }

    /// Leave the filesystem mounted when this handle is dropped
    pub fn keep_mounted(&mut self) {
        self.unmount_on_drop = false;
    }
}

impl fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountHandle")
            .field("mount_point", &self.mount_point)
            .field("device", &self.device)
            .field("mounted", &self.mounted)
            .finish()
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }
        if !self.unmount_on_drop {
            log::warn!("Leaving {} mounted on {}", self.device.display(), self.mount_point.display());
            return;
        }
        if let Err(e) = self.unmount() {
            log::error!("Failed to unmount {} on drop: {}", self.mount_point.display(), e);
        }
    }
}

/// The directory is only removed when empty; a leftover means something
/// still lives there and is worth a look.
fn remove_mount_dir(path: &Path) {
    if let Err(e) = fs::remove_dir(path) {
        log::warn!("Failed to remove mount point {}: {}", path.display(), e);
    }
}
