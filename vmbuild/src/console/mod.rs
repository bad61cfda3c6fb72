use clap::{Parser, Subcommand};
use build::{DiskCommandParam, IsoCommandParam, PostbuildParam, TargetParam};
use nbd::NbdCommand;

pub mod build;
pub mod nbd;
#[cfg(test)]
mod tests;

pub const DEFAULT_MANIFEST_PATH: &str = "vmbuild.toml";

#[derive(Debug, Parser, Clone)]
#[command(author, version, about)]
pub struct CommandLineArgs {
    /// 要执行的操作
    #[command(subcommand)]
    pub action: Action,

    /// vmbuild manifest 配置文件的路径 (相对于工作目录)
    #[arg(
        short = 'f',
        long = "manifest",
        default_value = DEFAULT_MANIFEST_PATH,
        global = true
    )]
    pub manifest_path: String,

    /// vmbuild 的工作目录
    #[arg(short = 'w', long = "workdir", default_value = ".", global = true)]
    pub workdir: String,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
pub enum Action {
    /// Build a partitioned disk image from a root filesystem tree
    Disk(DiskCommandParam),
    /// Build a bootable live ISO
    Iso(IsoCommandParam),
    /// Copy the tree to `<target>_rootfs`
    Rootfs(TargetParam),
    /// Write `<target>.kernel` and `<target>.initrd`
    Initrd(TargetParam),
    /// Run the manifest's `[postbuild]` scripts inside the tree with chroot
    Postbuild(PostbuildParam),
    /// Report which external tools are available
    Check,
    /// Network block device maintenance
    #[command(subcommand, name = "nbd")]
    Nbd(NbdCommand),
}

impl Action {
    /// 是否需要在启动时读取 manifest 文件
    pub fn needs_manifest(&self) -> bool {
        !matches!(self, Action::Check | Action::Nbd(_))
    }
}
