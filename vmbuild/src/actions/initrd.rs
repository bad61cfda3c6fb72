//! Direct-boot artifacts: a kernel and a newc initramfs holding the whole
//! build tree, for VMs booted with `-kernel`/`-initrd`.

use std::{fs, path::Path, path::PathBuf};

use super::{boot::BootFiles, populate::quote, staged::StagedFile};
use crate::{
    cancel::CancelToken,
    command::{ensure_tools, run_checked, CommandRunner, Tool, ToolCommand},
    error::BuildError,
    request::BuildRequest,
};

/// Paths written by [`export_boot_targets`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootTargets {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
}

/// Write `<target>.kernel` and `<target>.initrd` into the output dir.
pub fn export_boot_targets(
    runner: &dyn CommandRunner,
    cancel: &CancelToken,
    build_path: &Path,
    request: &BuildRequest,
) -> Result<BootTargets, BuildError> {
    ensure_tools(runner, &[Tool::Bash])?;
    let files = BootFiles::scan(&build_path.join("boot"))?;

    fs::create_dir_all(&request.output_dir).map_err(|e| {
        BuildError::io(format!("Failed to create {}", request.output_dir.display()), e)
    })?;

    cancel.check("initrd packing")?;
    let initrd = StagedFile::new(request.initrd_path());
    let script = format!(
        "set -o pipefail; cd {} && find . -print0 | cpio --quiet --null -o --format=newc | gzip -9 > {}",
        quote(build_path)?,
        quote(initrd.tmp_path())?
    );
    let mut cmd = ToolCommand::new(Tool::Bash);
    cmd.arg("-c").arg(script);
    run_checked(runner, &cmd, |reason| BuildError::ToolFailed {
        tool: "cpio".to_string(),
        reason,
    })?;

    let kernel = StagedFile::new(request.kernel_path());
    fs::copy(&files.kernel, kernel.tmp_path()).map_err(|e| {
        BuildError::io(
            format!(
                "Failed to copy {} to {}",
                files.kernel.display(),
                kernel.final_path().display()
            ),
            e,
        )
    })?;

    let initrd = initrd.publish()?;
    let kernel = kernel.publish()?;

    log::info!(
        "Boot targets written: {}, {}",
        kernel.display(),
        initrd.display()
    );
    Ok(BootTargets { kernel, initrd })
}
