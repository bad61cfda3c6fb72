use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::Parser;
use derive_builder::Builder;
use vmbuild_config::manifest::VmBuildManifest;

use crate::{
    cancel::CancelToken,
    console::{
        build::{DiskCommandParam, IsoCommandParam, TargetParam},
        CommandLineArgs,
    },
    request::{BuildRequest, BuildRequestBuilder},
    utils::{abs_path, check_dir_exists},
};

mod manifest;

/// vmbuild 的执行上下文
#[derive(Debug, Clone, Builder)]
pub struct VmBuildExecContext {
    pub command: CommandLineArgs,
    /// Parsed manifest, defaults when the command needs none
    manifest: VmBuildManifest,
    #[builder(default)]
    cancel: CancelToken,
}

pub fn build_exec_context() -> Result<VmBuildExecContext> {
    let ctx = build_exec_context_from(CommandLineArgs::parse())?;
    ctx.setup_workdir()?;
    Ok(ctx)
}

/// Build the context without touching the process working directory.
pub fn build_exec_context_from(args: CommandLineArgs) -> Result<VmBuildExecContext> {
    let mut builder = VmBuildExecContextBuilder::create_empty();
    builder.command(args);
    if builder.command.as_ref().map(|c| c.action.needs_manifest()) == Some(true) {
        manifest::parse_manifest(&mut builder)?;
    } else {
        builder.manifest(VmBuildManifest::default());
    }
    let ctx: VmBuildExecContext = builder.build()?;
    Ok(ctx)
}

impl VmBuildExecContext {
    /// 获取工作目录的绝对路径
    pub fn workdir(&self) -> PathBuf {
        abs_path(&PathBuf::from(&self.command.workdir))
    }

    /// 设置进程的工作目录
    fn setup_workdir(&self) -> Result<()> {
        let workdir = self.workdir();
        check_dir_exists(&workdir)?;
        std::env::set_current_dir(&workdir)
            .map_err(|e| anyhow!("Failed to set current directory: {}", e))?;
        Ok(())
    }

    pub fn manifest(&self) -> &VmBuildManifest {
        &self.manifest
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Request for the rootfs and initrd exporters
    pub fn target_request(&self, param: &TargetParam) -> Result<BuildRequest> {
        let builder = self.request_builder(param);
        Ok(builder.build()?)
    }

    /// Request for a disk build: manifest `[disk]` values, overridden by the
    /// command line.
    pub fn disk_request(&self, param: &DiskCommandParam) -> Result<BuildRequest> {
        let disk = &self.manifest.disk;
        let mut builder = self.request_builder(&param.target);
        builder
            .format(
                param
                    .format
                    .clone()
                    .unwrap_or_else(|| disk.format.to_string()),
            )
            .disk_size(param.size.clone().unwrap_or_else(|| disk.size.clone()))
            .fs_type(disk.fs_type)
            .mbr(param.mbr.clone().or_else(|| disk.mbr.clone()));
        Ok(builder.build()?)
    }

    pub fn iso_request(&self, param: &IsoCommandParam) -> Result<BuildRequest> {
        let iso = &self.manifest.iso;
        let mut builder = self.request_builder(&param.target);
        builder
            .isolinux_dir(
                param
                    .isolinux
                    .clone()
                    .unwrap_or_else(|| iso.isolinux_dir.clone()),
            )
            .volume_id(iso.volume_id.clone());
        Ok(builder.build()?)
    }

    fn request_builder(&self, param: &TargetParam) -> BuildRequestBuilder {
        let metadata = &self.manifest.metadata;
        let target_name = param
            .target
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.manifest.target_name(&param.build_path));
        let output_dir = param
            .output_dir
            .clone()
            .unwrap_or_else(|| metadata.output_dir.clone());

        let mut builder = BuildRequestBuilder::default();
        builder
            .source_path(abs_path(&param.build_path))
            .target_name(target_name)
            .output_dir(abs_path(&output_dir));
        builder
    }
}

/// Resolve `path` against the working directory given on the command line.
pub(crate) fn resolve(workdir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use vmbuild_config::disk::fstype::FsType;

    fn context(args: &[&str], manifest: &str) -> VmBuildExecContext {
        let mut builder = VmBuildExecContextBuilder::create_empty();
        builder
            .command(CommandLineArgs::parse_from(args))
            .manifest(VmBuildManifest::load_from_str(manifest).unwrap());
        builder.build().unwrap()
    }

    #[test]
    fn test_disk_request_from_manifest() {
        let ctx = context(
            &["vmbuild", "disk", "/build/debian.stage1"],
            r#"
            [metadata]
            output_dir = "/out"

            [disk]
            format = "vmdk"
            size = "2G"
            fs_type = "ext3"
            "#,
        );
        let crate::console::Action::Disk(param) = &ctx.command.action else {
            panic!("Expected Action::Disk");
        };
        let req = ctx.disk_request(param).unwrap();
        assert_eq!(req.target_name, "debian");
        assert_eq!(req.format, "vmdk");
        assert_eq!(req.disk_size.as_str(), "2G");
        assert_eq!(req.fs_type, FsType::Ext3);
        assert_eq!(req.output_dir, PathBuf::from("/out"));
        assert_eq!(req.source_path, PathBuf::from("/build/debian.stage1"));
        assert!(req.mbr.is_none());
    }

    #[test]
    fn test_disk_request_cli_overrides() {
        let ctx = context(
            &[
                "vmbuild",
                "disk",
                "/build/debian.stage1",
                "--format",
                "raw",
                "--size",
                "8G",
                "-O",
                "minimal",
                "--output-dir",
                "/elsewhere",
            ],
            r#"
            [metadata]
            target = "from-manifest"
            output_dir = "/out"

            [disk]
            format = "vmdk"
            mbr = "/usr/lib/syslinux/mbr/mbr.bin"
            "#,
        );
        let crate::console::Action::Disk(param) = &ctx.command.action else {
            panic!("Expected Action::Disk");
        };
        let req = ctx.disk_request(param).unwrap();
        assert_eq!(req.target_name, "minimal");
        assert_eq!(req.format, "raw");
        assert_eq!(req.disk_size.as_str(), "8G");
        assert_eq!(req.output_dir, PathBuf::from("/elsewhere"));
        assert_eq!(req.mbr, Some(PathBuf::from("/usr/lib/syslinux/mbr/mbr.bin")));
    }

    #[test]
    fn test_iso_request() {
        let ctx = context(
            &["vmbuild", "iso", "/build/debian.stage1"],
            r#"
            [metadata]
            target = "live"

            [iso]
            isolinux_dir = "/usr/lib/ISOLINUX"
            volume_id = "LIVE"
            "#,
        );
        let crate::console::Action::Iso(param) = &ctx.command.action else {
            panic!("Expected Action::Iso");
        };
        let req = ctx.iso_request(param).unwrap();
        assert_eq!(req.target_name, "live");
        assert_eq!(req.isolinux_dir, PathBuf::from("/usr/lib/ISOLINUX"));
        assert_eq!(req.volume_id, "LIVE");
        assert_eq!(req.iso_path().file_name().unwrap(), "live.iso");
    }

    #[test]
    fn test_build_exec_context_missing_default_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().display().to_string();
        let ctx = build_exec_context_from(CommandLineArgs::parse_from([
            "vmbuild",
            "-w",
            workdir.as_str(),
            "rootfs",
            "/build/debian.stage1",
        ]))
        .unwrap();
        assert_eq!(ctx.manifest().disk.size.as_str(), "1G");
    }

    #[test]
    fn test_build_exec_context_missing_explicit_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().display().to_string();
        let r = build_exec_context_from(CommandLineArgs::parse_from([
            "vmbuild",
            "-w",
            workdir.as_str(),
            "-f",
            "custom.toml",
            "rootfs",
            "/build/debian.stage1",
        ]));
        assert!(r.is_err());
    }

    #[test]
    fn test_build_exec_context_reads_manifest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("vmbuild.toml"),
            "[metadata]\ntarget = \"from-file\"\n",
        )
        .unwrap();
        let workdir = dir.path().display().to_string();
        let ctx = build_exec_context_from(CommandLineArgs::parse_from([
            "vmbuild",
            "-w",
            workdir.as_str(),
            "initrd",
            "/build/debian.stage1",
        ]))
        .unwrap();
        assert_eq!(ctx.manifest().metadata.target.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_resolve() {
        let wd = Path::new("/work");
        assert_eq!(resolve(wd, Path::new("a.toml")), PathBuf::from("/work/a.toml"));
        assert_eq!(resolve(wd, Path::new("/etc/a.toml")), PathBuf::from("/etc/a.toml"));
    }
}
