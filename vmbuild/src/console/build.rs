use std::path::PathBuf;

use clap::Args;
use vmbuild_config::utils::size::DiskSize;

/// Options shared by every build command
#[derive(Debug, Args, Clone, PartialEq, Eq)]
pub struct TargetParam {
    /// Populated root filesystem tree
    pub build_path: PathBuf,

    /// Artifact base name (default: build path basename up to the first '.')
    #[arg(short = 'O', long = "target")]
    pub target: Option<String>,

    /// Where artifacts are written
    #[arg(long = "output-dir")]
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Clone, PartialEq, Eq)]
pub struct DiskCommandParam {
    #[command(flatten)]
    pub target: TargetParam,

    /// Disk format: raw, qcow2, qcow or vmdk
    #[arg(long)]
    pub format: Option<String>,

    /// Disk size, e.g. 1G or 512M
    #[arg(long)]
    pub size: Option<DiskSize>,

    /// Populate the disk from a `docker save` archive instead of the build tree
    #[arg(long = "docker")]
    pub docker: Option<PathBuf>,

    /// Install extlinux and write this master boot record
    #[arg(long)]
    pub mbr: Option<PathBuf>,
}

#[derive(Debug, Args, Clone, PartialEq, Eq)]
pub struct PostbuildParam {
    /// Root filesystem tree to customize in place
    pub build_path: PathBuf,
}

#[derive(Debug, Args, Clone, PartialEq, Eq)]
pub struct IsoCommandParam {
    #[command(flatten)]
    pub target: TargetParam,

    /// Directory holding isolinux.bin, ldlinux.c32 and isolinux.cfg
    #[arg(long)]
    pub isolinux: Option<PathBuf>,
}
