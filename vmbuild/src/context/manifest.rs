use std::path::PathBuf;

use anyhow::{anyhow, Result};
use vmbuild_config::manifest::VmBuildManifest;

use super::{resolve, VmBuildExecContextBuilder};
use crate::{console::DEFAULT_MANIFEST_PATH, utils::abs_path};

/// Load the manifest named on the command line into the builder.
///
/// A missing manifest at the default path means "use the defaults"; a
/// manifest path given explicitly must exist.
pub(super) fn parse_manifest(builder: &mut VmBuildExecContextBuilder) -> Result<()> {
    let (manifest_arg, workdir) = {
        let command = builder
            .command
            .as_ref()
            .ok_or_else(|| anyhow!("Command line arguments not set"))?;
        (command.manifest_path.clone(), command.workdir.clone())
    };

    // 将相对路径转换为基于workdir的绝对路径
    let manifest_path = resolve(&abs_path(&PathBuf::from(workdir)), &PathBuf::from(&manifest_arg));

    if !manifest_path.exists() && manifest_arg == DEFAULT_MANIFEST_PATH {
        log::info!(
            "No manifest at {}, using defaults",
            manifest_path.display()
        );
        builder.manifest(VmBuildManifest::default());
        return Ok(());
    }
    if !manifest_path.is_file() {
        return Err(anyhow!(
            "Manifest path '{}' does not exist or is not a file",
            manifest_path.display()
        ));
    }

    let manifest = VmBuildManifest::load(&manifest_path)
        .map_err(|e| anyhow!("Failed to load manifest '{}': {}", manifest_path.display(), e))?;
    builder.manifest(manifest);
    Ok(())
}
