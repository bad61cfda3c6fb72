use std::{fs, path::Path, path::PathBuf};

use super::populate::copy_tree_contents;
use crate::{
    cancel::CancelToken,
    command::{ensure_tools, CommandRunner, Tool},
    error::BuildError,
    request::BuildRequest,
};

/// Copy the build tree to `<output_dir>/<target>_rootfs`.
///
/// The destination must not exist yet: an earlier export is never merged
/// into or overwritten.
pub fn export_rootfs(
    runner: &dyn CommandRunner,
    cancel: &CancelToken,
    build_path: &Path,
    request: &BuildRequest,
) -> Result<PathBuf, BuildError> {
    ensure_tools(runner, &[Tool::Cp])?;
    if !build_path.is_dir() {
        return Err(BuildError::Config(format!(
            "build path '{}' is not a directory",
            build_path.display()
        )));
    }
    cancel.check("rootfs export")?;

    fs::create_dir_all(&request.output_dir).map_err(|e| {
        BuildError::io(format!("Failed to create {}", request.output_dir.display()), e)
    })?;
    let target = request.rootfs_dir();
    fs::create_dir(&target)
        .map_err(|e| BuildError::io(format!("Failed to create {}", target.display()), e))?;

    copy_tree_contents(runner, build_path, &target)?;
    log::info!("Root filesystem exported to {}", target.display());
    Ok(target)
}
