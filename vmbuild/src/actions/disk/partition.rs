use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use lazy_static::lazy_static;
use regex::Regex;
use vmbuild_config::{
    disk::{format::DiskFormat, fstype::FsType},
    utils::size::DiskSize,
};

use super::nbd::DeviceKind;
use crate::{
    command::{run_checked, CommandRunner, Tool, ToolCommand},
    error::BuildError,
};

/// Size of the first (bootable, root) partition. The rest of the disk
/// becomes a second partition.
pub const FIRST_PARTITION_SIZE: &str = "500M";

/// Partition that is formatted and mounted
pub const ROOT_PARTITION: u8 = 1;

lazy_static! {
    static ref KPARTX_ADD_MAP: Regex = Regex::new(r"^add map (\S+)").unwrap();
}

/// sfdisk input describing the disk layout
pub fn sfdisk_script() -> String {
    format!(",{},L,*\n,,L\n", FIRST_PARTITION_SIZE)
}

/// `qemu-img create -f <format> <path> <size>`
pub fn create_image(
    runner: &dyn CommandRunner,
    path: &Path,
    format: DiskFormat,
    size: &DiskSize,
) -> Result<(), BuildError> {
    let mut cmd = ToolCommand::new(Tool::QemuImg);
    cmd.arg("create")
        .arg("-f")
        .arg(format.to_string())
        .arg(path)
        .arg(size.as_str());
    run_checked(runner, &cmd, |reason| BuildError::ImageCreateFailed {
        path: path.to_path_buf(),
        reason,
    })?;
    log::info!("Created {} image {} ({})", format, path.display(), size);
    Ok(())
}

/// Write the partition table to a whole disk (device node or image file).
pub fn partition_disk(runner: &dyn CommandRunner, disk: &Path) -> Result<(), BuildError> {
    let mut cmd = ToolCommand::new(Tool::Sfdisk);
    cmd.arg(disk).stdin(sfdisk_script());
    run_checked(runner, &cmd, |reason| BuildError::PartitionFailed {
        device: disk.to_path_buf(),
        reason,
    })?;
    log::info!("Partitioned {}", disk.display());
    Ok(())
}

/// `mkfs -t <fs> <partition>`
pub fn format_partition(
    runner: &dyn CommandRunner,
    partition: &Path,
    fs_type: FsType,
) -> Result<(), BuildError> {
    let mut cmd = ToolCommand::new(Tool::Mkfs);
    cmd.arg("-t").arg(fs_type.mkfs_type()).arg(partition);
    run_checked(runner, &cmd, |reason| BuildError::FormatFailed {
        device: partition.to_path_buf(),
        reason,
    })?;
    log::info!("Formatted {} as {}", partition.display(), fs_type);
    Ok(())
}

/// Device-mapper nodes created by `kpartx -a` for the partitions of a raw
/// image. Removed with `kpartx -d`.
pub struct PartitionMapper {
    image: PathBuf,
    partitions: Vec<PathBuf>,
    mapped: bool,
    remove_on_drop: bool,
    runner: Arc<dyn CommandRunner>,
}

impl PartitionMapper {
    pub fn map(
        runner: Arc<dyn CommandRunner>,
        image: &Path,
        mapper_dir: &Path,
    ) -> Result<Self, BuildError> {
        let mut cmd = ToolCommand::new(Tool::Kpartx);
        cmd.arg("-a").arg("-v").arg(image);
        let output = run_checked(runner.as_ref(), &cmd, |reason| BuildError::PartitionFailed {
            device: image.to_path_buf(),
            reason,
        })?;

        let partitions = parse_kpartx_maps(&output.stdout, mapper_dir);
        let mut mapper = PartitionMapper {
            image: image.to_path_buf(),
            partitions,
            mapped: true,
            remove_on_drop: true,
            runner,
        };
        if mapper.partitions.is_empty() {
            // kpartx added nothing, there is nothing to remove either
            mapper.mapped = false;
            return Err(BuildError::NoDeviceAvailable {
                kind: DeviceKind::MappedPartition,
                attempts: 1,
            });
        }
        log::info!(
            "Mapped partitions of {}: {:?}",
            image.display(),
            mapper.partitions
        );
        Ok(mapper)
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn mapped(&self) -> bool {
        self.mapped
    }

    /// Mapper node of partition `nth` (1-based)
    pub fn partition_path(&self, nth: u8) -> Result<&Path, BuildError> {
        if !self.mapped {
            return Err(BuildError::NotActive {
                resource: format!("partition mapping of {}", self.image.display()),
            });
        }
        self.partitions
            .get(usize::from(nth).wrapping_sub(1))
            .map(PathBuf::as_path)
            .ok_or(BuildError::NoDeviceAvailable {
                kind: DeviceKind::MappedPartition,
                attempts: 1,
            })
    }

    pub fn unmap(&mut self) -> Result<(), BuildError> {
        if !self.mapped {
            return Err(BuildError::NotActive {
                resource: format!("partition mapping of {}", self.image.display()),
            });
        }
        let mut cmd = ToolCommand::new(Tool::Kpartx);
        cmd.arg("-d").arg(&self.image);
        run_checked(self.runner.as_ref(), &cmd, |reason| BuildError::DetachFailed {
            device: self.image.clone(),
            reason,
        })?;
        self.mapped = false;
        log::info!("Removed partition mapping of {}", self.image.display());
        Ok(())
    }

    /// Leave the mapping in place when dropped
    pub fn keep_mapped(&mut self) {
        self.remove_on_drop = false;
    }
}

impl fmt::Debug for PartitionMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionMapper")
            .field("image", &self.image)
            .field("partitions", &self.partitions)
            .field("mapped", &self.mapped)
            .finish()
    }
}

impl Drop for PartitionMapper {
    fn drop(&mut self) {
        if !self.mapped {
            return;
        }
        if !self.remove_on_drop {
            log::warn!(
                "Leaving partition mapping of {} in place, remove it with `kpartx -d {}`",
                self.image.display(),
                self.image.display()
            );
            return;
        }
        if let Err(e) = self.unmap() {
            log::error!(
                "Failed to remove partition mapping of {} on drop: {}",
                self.image.display(),
                e
            );
        }
    }
}

fn parse_kpartx_maps(output: &str, mapper_dir: &Path) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| KPARTX_ADD_MAP.captures(line.trim()))
        .map(|caps| mapper_dir.join(&caps[1]))
        .collect()
}
