use std::path::PathBuf;

use derive_builder::Builder;
use vmbuild_config::{
    disk::{format::DiskFormat, fstype::FsType},
    utils::size::DiskSize,
};

use crate::error::BuildError;

/// Everything one build needs to know, resolved from the manifest and the
/// command line. Immutable once built.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct BuildRequest {
    /// Populated root filesystem tree
    pub source_path: PathBuf,
    /// Base name of every artifact
    pub target_name: String,
    /// Disk format as given by the user, validated by the disk builder
    #[builder(default = "DiskFormat::default().to_string()")]
    pub format: String,
    #[builder(default)]
    pub disk_size: DiskSize,
    #[builder(default = "PathBuf::from(\".\")")]
    pub output_dir: PathBuf,
    #[builder(default)]
    pub fs_type: FsType,
    #[builder(default = "PathBuf::from(\"misc/isolinux/\")")]
    pub isolinux_dir: PathBuf,
    #[builder(default = "\"vmbuild\".to_string()")]
    pub volume_id: String,
    /// Master boot record written after extlinux is installed
    #[builder(default)]
    pub mbr: Option<PathBuf>,
}

impl BuildRequest {
    pub fn disk_format(&self) -> Result<DiskFormat, BuildError> {
        DiskFormat::try_from(self.format.as_str()).map_err(BuildError::Config)
    }

    pub fn iso_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.iso", self.target_name))
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.output_dir.join(format!("{}_rootfs", self.target_name))
    }

    pub fn kernel_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.kernel", self.target_name))
    }

    pub fn initrd_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.initrd", self.target_name))
    }
}
