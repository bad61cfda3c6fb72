//! Post-build customization: shell scripts run inside the build tree with
//! `chroot`, with `/proc` and the host's `/dev` mounted for the duration.

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::Path,
    sync::Arc,
};

use super::disk::mount::MountHandle;
use crate::{
    cancel::CancelToken,
    command::{ensure_tools, run_checked, CommandRunner, Tool, ToolCommand},
    error::BuildError,
};

/// Where each script is written, relative to the build tree
const SCRIPT_PATH: &str = "tmp/postbuild.bash";

/// `/proc` and `/dev` mounted inside a build tree.
///
/// Mounts are kept in mount order and released newest first.
#[derive(Debug)]
pub struct ChrootMounts {
    mounts: Vec<MountHandle>,
}

impl ChrootMounts {
    /// Mount `proc` on `<root>/proc`, then bind `/dev` on `<root>/dev`.
    /// When the second mount fails the first one is released again.
    pub fn mount(runner: Arc<dyn CommandRunner>, root: &Path) -> Result<Self, BuildError> {
        let mut chroot = ChrootMounts { mounts: Vec::new() };
        let steps: [(&str, &str, &[&str]); 2] = [
            ("proc", "none", &["-t", "proc"]),
            ("dev", "/dev", &["-o", "bind"]),
        ];
        for (dir, source, options) in steps {
            let target = root.join(dir);
            let mounted = create_dir(&target).and_then(|_| {
                MountHandle::mount_at(runner.clone(), Path::new(source), &target, options)
            });
            match mounted {
                Ok(handle) => chroot.mounts.push(handle),
                Err(e) => return Err(e.with_cleanup(chroot.release())),
            }
        }
        Ok(chroot)
    }

    pub fn mount_points(&self) -> Vec<&Path> {
        self.mounts.iter().map(|m| m.mount_point()).collect()
    }

    /// Unmount everything, newest first. Every mount is attempted; the ones
    /// that fail stay mounted and are reported.
    pub fn release(&mut self) -> Vec<BuildError> {
        let mut errors = Vec::new();
        while let Some(mut mount) = self.mounts.pop() {
            if let Err(e) = mount.unmount() {
                mount.keep_mounted();
                errors.push(e);
            }
        }
        errors
    }
}

impl Drop for ChrootMounts {
    fn drop(&mut self) {
        for e in self.release() {
            log::error!("Failed to release chroot mount: {}", e);
        }
    }
}

/// Run `scripts` in order inside `build_path`. Stops at the first failing
/// script. Mount releases that fail are reported alongside the primary error,
/// or as the error when every script succeeded.
pub fn run_postbuild(
    runner: Arc<dyn CommandRunner>,
    cancel: &CancelToken,
    build_path: &Path,
    scripts: &[String],
) -> Result<(), BuildError> {
    if scripts.is_empty() {
        log::info!("No postbuild scripts configured");
        return Ok(());
    }
    ensure_tools(runner.as_ref(), &[Tool::Mount, Tool::Umount, Tool::Chroot])?;
    if !build_path.is_dir() {
        return Err(BuildError::Config(format!(
            "build path '{}' is not a directory",
            build_path.display()
        )));
    }

    cancel.check("postbuild mounts")?;
    let mut mounts = ChrootMounts::mount(runner.clone(), build_path)?;

    let result = scripts
        .iter()
        .enumerate()
        .try_for_each(|(i, script)| {
            cancel.check(&format!("postbuild script {}", i + 1))?;
            run_script(runner.as_ref(), build_path, i + 1, script)
        });

    let mut cleanup = mounts.release().into_iter();
    match result {
        Err(e) => Err(e.with_cleanup(cleanup.collect())),
        Ok(()) => match cleanup.next() {
            None => Ok(()),
            Some(first) => Err(first.with_cleanup(cleanup.collect())),
        },
    }
}

fn run_script(
    runner: &dyn CommandRunner,
    root: &Path,
    nth: usize,
    script: &str,
) -> Result<(), BuildError> {
    let path = root.join(SCRIPT_PATH);
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(&path, script)
        .and_then(|_| fs::set_permissions(&path, fs::Permissions::from_mode(0o770)))
        .map_err(|e| BuildError::io(format!("Failed to write {}", path.display()), e))?;

    log::info!("Running postbuild script {} in {}", nth, root.display());
    let mut cmd = ToolCommand::new(Tool::Chroot);
    cmd.arg(root)
        .arg("/bin/bash")
        .arg(Path::new("/").join(SCRIPT_PATH));
    let result = run_checked(runner, &cmd, |reason| BuildError::ToolFailed {
        tool: format!("postbuild script {}", nth),
        reason,
    });

    remove_script(&path);
    result.map(|_| ())
}

fn remove_script(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        log::warn!("Failed to remove {}: {}", path.display(), e);
    }
}

fn create_dir(path: &Path) -> Result<(), BuildError> {
    fs::create_dir_all(path)
        .map_err(|e| BuildError::io(format!("Failed to create {}", path.display()), e))
}
