use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::error::BuildError;

const KERNEL_PREFIX: &str = "vmlinu";
const INITRD_PREFIX: &str = "initrd";

/// Kernel and initrd found in a `boot` directory.
///
/// When several files match, the lexicographically first one wins, so the
/// same tree always yields the same pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootFiles {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
}

impl BootFiles {
    pub fn scan(boot_dir: &Path) -> Result<Self, BuildError> {
        let entries = fs::read_dir(boot_dir).map_err(|_| BuildError::ArtifactNotFound {
            what: "boot directory".to_string(),
            dir: boot_dir.to_path_buf(),
        })?;
        let names = regular_file_names(boot_dir, entries.map(|e| e.map(|e| e.path())))?;

        let first = |prefix: &str, what: &str| {
            names
                .iter()
                .find(|name| name.starts_with(prefix))
                .map(|name| boot_dir.join(name))
                .ok_or_else(|| BuildError::ArtifactNotFound {
                    what: what.to_string(),
                    dir: boot_dir.to_path_buf(),
                })
        };

        let files = BootFiles {
            kernel: first(KERNEL_PREFIX, "kernel (vmlinu*)")?,
            initrd: first(INITRD_PREFIX, "initrd (initrd*)")?,
        };
        log::debug!(
            "Boot files in {}: kernel {}, initrd {}",
            boot_dir.display(),
            files.kernel.display(),
            files.initrd.display()
        );
        Ok(files)
    }

    pub fn kernel_name(&self) -> String {
        file_name(&self.kernel)
    }

    pub fn initrd_name(&self) -> String {
        file_name(&self.initrd)
    }
}

/// Sorted names of the regular files among `entries`. Names that are not
/// valid UTF-8 cannot match a prefix and are skipped.
fn regular_file_names<I>(dir: &Path, entries: I) -> Result<Vec<String>, BuildError>
where
    I: IntoIterator<Item = io::Result<PathBuf>>,
{
    let mut names = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| BuildError::io(format!("Failed to read {}", dir.display()), e))?;
        if !path.is_file() {
            continue;
        }
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => names.push(name.to_string()),
            None => log::warn!("Skipping non UTF-8 file name {}", path.display()),
        }
    }
    names.sort();
    Ok(names)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
