//! Live ISO mastering.
//!
//! Layout of the image tree handed to genisoimage:
//!
//! ```text
//! image/
//!   live/vmlinuz
//!   live/initrd
//!   live/filesystem.squashfs   (build tree minus /boot)
//!   isolinux/*                 (copied from the isolinux dir)
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use tempfile::TempDir;

use super::{boot::BootFiles, staged::StagedFile};
use crate::{
    cancel::CancelToken,
    command::{ensure_tools, run_checked, CommandRunner, Tool, ToolCommand},
    error::BuildError,
    request::BuildRequest,
};

const WORK_DIR_PREFIX: &str = "vmbuild_iso_";

/// Scratch tree of one ISO build. The work dir is removed when this value
/// is dropped, whatever happened to the build.
#[derive(Debug)]
pub struct IsoAssembly {
    pub kernel_path: PathBuf,
    pub initrd_path: PathBuf,
    pub output_iso_path: PathBuf,
    work_dir: TempDir,
}

impl IsoAssembly {
    fn prepare(files: &BootFiles, isolinux_dir: &Path, output_iso_path: PathBuf) -> Result<Self, BuildError> {
        let work_dir = tempfile::Builder::new()
            .prefix(WORK_DIR_PREFIX)
            .tempdir()
            .map_err(|e| BuildError::io("Failed to create ISO work dir", e))?;

        let assembly = IsoAssembly {
            kernel_path: files.kernel.clone(),
            initrd_path: files.initrd.clone(),
            output_iso_path,
            work_dir,
        };
        create_dir(&assembly.live_dir())?;
        create_dir(&assembly.isolinux_dir())?;

        copy_file(&assembly.kernel_path, &assembly.live_dir().join("vmlinuz"))?;
        copy_file(&assembly.initrd_path, &assembly.live_dir().join("initrd"))?;

        let entries = fs::read_dir(isolinux_dir).map_err(|e| {
            BuildError::io(format!("Failed to read {}", isolinux_dir.display()), e)
        })?;
        for entry in entries {
            let path = entry
                .map_err(|e| BuildError::io(format!("Failed to read {}", isolinux_dir.display()), e))?
                .path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name() {
                copy_file(&path, &assembly.isolinux_dir().join(name))?;
            }
        }
        Ok(assembly)
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    pub fn image_dir(&self) -> PathBuf {
        self.work_dir().join("image")
    }

    fn live_dir(&self) -> PathBuf {
        self.image_dir().join("live")
    }

    fn isolinux_dir(&self) -> PathBuf {
        self.image_dir().join("isolinux")
    }

    fn squashfs_path(&self) -> PathBuf {
        self.live_dir().join("filesystem.squashfs")
    }

    /// Remove the work dir, reporting failures.
    fn close(self) -> Result<(), BuildError> {
        let path = self.work_dir.path().to_path_buf();
        self.work_dir
            .close()
            .map_err(|e| BuildError::io(format!("Failed to remove {}", path.display()), e))
    }
}

fn create_dir(path: &Path) -> Result<(), BuildError> {
    fs::create_dir_all(path)
        .map_err(|e| BuildError::io(format!("Failed to create {}", path.display()), e))
}

fn copy_file(from: &Path, to: &Path) -> Result<(), BuildError> {
    fs::copy(from, to).map_err(|e| {
        BuildError::io(
            format!("Failed to copy {} to {}", from.display(), to.display()),
            e,
        )
    })?;
    Ok(())
}

/// Build `<output_dir>/<target>.iso` from the tree at `build_path`.
pub fn build_iso(
    runner: &dyn CommandRunner,
    cancel: &CancelToken,
    build_path: &Path,
    request: &BuildRequest,
) -> Result<PathBuf, BuildError> {
    ensure_tools(runner, &[Tool::Mksquashfs, Tool::Genisoimage])?;
    if !build_path.is_dir() {
        return Err(BuildError::Config(format!(
            "build path '{}' is not a directory",
            build_path.display()
        )));
    }

    let files = BootFiles::scan(&build_path.join("boot"))?;
    if !request.isolinux_dir.is_dir() {
        return Err(BuildError::ArtifactNotFound {
            what: "isolinux directory".to_string(),
            dir: request.isolinux_dir.clone(),
        });
    }
    create_dir(&request.output_dir)?;

    cancel.check("ISO staging")?;
    let assembly = IsoAssembly::prepare(&files, &request.isolinux_dir, request.iso_path())?;
    log::info!(
        "Building ISO {} in {}",
        assembly.output_iso_path.display(),
        assembly.work_dir().display()
    );

    cancel.check("squashfs compression")?;
    let mut squash = ToolCommand::new(Tool::Mksquashfs);
    squash
        .arg(build_path)
        .arg(assembly.squashfs_path())
        .arg("-e")
        .arg("boot");
    run_checked(runner, &squash, |reason| BuildError::ToolFailed {
        tool: Tool::Mksquashfs.to_string(),
        reason,
    })?;

    cancel.check("ISO mastering")?;
    let staged = StagedFile::new(assembly.output_iso_path.clone());
    let mut master = ToolCommand::new(Tool::Genisoimage);
    master
        .arg("-rational-rock")
        .arg("-volid")
        .arg(&request.volume_id)
        .args([
            "-cache-inodes",
            "-joliet",
            "-full-iso9660-filenames",
            "-b",
            "isolinux/isolinux.bin",
            "-c",
            "isolinux/boot.cat",
            "-no-emul-boot",
            "-boot-load-size",
            "4",
            "-boot-info-table",
            "-output",
        ])
        .arg(staged.tmp_path())
        .arg(assembly.image_dir());
    run_checked(runner, &master, |reason| BuildError::ToolFailed {
        tool: Tool::Genisoimage.to_string(),
        reason,
    })?;

    let iso = staged.publish()?;
    assembly.close()?;
    log::info!("ISO written to {}", iso.display());
    Ok(iso)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use test_base::{
        global::BuildTreeTestContext,
        test_context::{self as test_context, test_context},
    };

    use super::*;
    use crate::{
        command::{mock::RecordingRunner, CommandOutput},
        request::BuildRequestBuilder,
    };

    fn request(ctx: &BuildTreeTestContext) -> BuildRequest {
        BuildRequestBuilder::default()
            .source_path(ctx.build_dir())
            .target_name("debian")
            .output_dir(ctx.output_dir())
            .isolinux_dir(ctx.isolinux_dir())
            .volume_id("DEBIAN")
            .build()
            .unwrap()
    }

    /// Snapshots the staged work dir when genisoimage runs
    struct InspectingRunner {
        inner: RecordingRunner,
        staged: Mutex<Vec<String>>,
    }

    impl CommandRunner for InspectingRunner {
        fn locate(&self, tool: Tool) -> Result<PathBuf, BuildError> {
            self.inner.locate(tool)
        }

        fn run(&self, cmd: &ToolCommand) -> Result<CommandOutput, BuildError> {
            if cmd.tool() == Tool::Genisoimage {
                let image = PathBuf::from(cmd.get_args().last().unwrap());
                let mut staged = self.staged.lock().unwrap();
                for sub in ["live", "isolinux"] {
                    for entry in fs::read_dir(image.join(sub)).unwrap() {
                        staged.push(format!("{}/{}", sub, entry.unwrap().file_name().to_string_lossy()));
                    }
                }
                staged.sort();

                let args = cmd.get_args();
                let out_idx = args.iter().position(|a| a == "-output").unwrap();
                fs::write(&args[out_idx + 1], b"iso").unwrap();
            }
            self.inner.run(cmd)
        }
    }

    #[test_context(BuildTreeTestContext)]
    #[test]
    fn test_build_iso(ctx: &mut BuildTreeTestContext) {
        let runner = InspectingRunner {
            inner: RecordingRunner::new(),
            staged: Mutex::new(Vec::new()),
        };
        let iso = build_iso(&runner, &CancelToken::new(), &ctx.build_dir(), &request(ctx)).unwrap();

        assert_eq!(iso, ctx.output_dir().join("debian.iso"));
        assert_eq!(fs::read(&iso).unwrap(), b"iso");
        assert_eq!(runner.inner.count(Tool::Mksquashfs), 1);
        assert_eq!(runner.inner.count(Tool::Genisoimage), 1);

        let calls = runner.inner.calls();
        let squash = calls[0].get_args();
        assert_eq!(squash[0], ctx.build_dir().display().to_string());
        assert!(squash[1].ends_with("image/live/filesystem.squashfs"));
        assert_eq!(&squash[2..], &["-e", "boot"]);

        let master = calls[1].get_args();
        assert_eq!(&master[..3], &["-rational-rock", "-volid", "DEBIAN"]);
        let out_idx = master.iter().position(|a| a == "-output").unwrap();
        assert_eq!(master[out_idx + 1], format!("{}.tmp", iso.display()));

        assert_eq!(
            *runner.staged.lock().unwrap(),
            vec![
                "isolinux/isolinux.bin",
                "isolinux/isolinux.cfg",
                "isolinux/ldlinux.c32",
                "live/initrd",
                "live/vmlinuz"
            ]
        );

        // work dir is gone after success
        let image = PathBuf::from(master.last().unwrap());
        assert!(!image.exists());
    }

    #[test_context(BuildTreeTestContext)]
    #[test]
    fn test_build_iso_without_kernel(ctx: &mut BuildTreeTestContext) {
        fs::remove_file(ctx.boot_dir().join(BuildTreeTestContext::KERNEL_NAME)).unwrap();
        let runner = RecordingRunner::new();

        let err = build_iso(&runner, &CancelToken::new(), &ctx.build_dir(), &request(ctx)).unwrap_err();
        assert!(matches!(err, BuildError::ArtifactNotFound { .. }));
        assert_eq!(runner.count(Tool::Mksquashfs), 0);
        assert_eq!(runner.count(Tool::Genisoimage), 0);
    }

    #[test_context(BuildTreeTestContext)]
    #[test]
    fn test_build_iso_without_isolinux(ctx: &mut BuildTreeTestContext) {
        fs::remove_dir_all(ctx.isolinux_dir()).unwrap();
        let runner = RecordingRunner::new();

        let err = build_iso(&runner, &CancelToken::new(), &ctx.build_dir(), &request(ctx)).unwrap_err();
        assert!(matches!(err, BuildError::ArtifactNotFound { .. }));
        assert!(runner.calls().is_empty());
    }

    #[test_context(BuildTreeTestContext)]
    #[test]
    fn test_build_iso_mastering_failure(ctx: &mut BuildTreeTestContext) {
        let runner = RecordingRunner::new();
        runner.fail_when(Tool::Genisoimage, None);

        let err = build_iso(&runner, &CancelToken::new(), &ctx.build_dir(), &request(ctx)).unwrap_err();
        assert!(matches!(err, BuildError::ToolFailed { .. }));
        assert!(!ctx.output_dir().join("debian.iso").exists());

        // the work dir was dropped with the error
        let calls = runner.calls();
        let image = PathBuf::from(calls[1].get_args().last().unwrap());
        assert!(!image.exists());
    }

    /// genisoimage that writes part of the image and then fails
    struct PartialWriteRunner {
        inner: RecordingRunner,
    }

    impl CommandRunner for PartialWriteRunner {
        fn locate(&self, tool: Tool) -> Result<PathBuf, BuildError> {
            self.inner.locate(tool)
        }

        fn run(&self, cmd: &ToolCommand) -> Result<CommandOutput, BuildError> {
            let output = self.inner.run(cmd)?;
            if cmd.tool() != Tool::Genisoimage {
                return Ok(output);
            }
            let args = cmd.get_args();
            let out_idx = args.iter().position(|a| a == "-output").unwrap();
            fs::write(&args[out_idx + 1], b"partial").unwrap();
            Ok(CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "write error".to_string(),
            })
        }
    }

    #[test_context(BuildTreeTestContext)]
    #[test]
    fn test_build_iso_partial_output_removed(ctx: &mut BuildTreeTestContext) {
        let runner = PartialWriteRunner {
            inner: RecordingRunner::new(),
        };

        let err = build_iso(&runner, &CancelToken::new(), &ctx.build_dir(), &request(ctx)).unwrap_err();
        assert!(matches!(err, BuildError::ToolFailed { .. }));
        assert!(!ctx.output_dir().join("debian.iso").exists());
        assert!(!ctx.output_dir().join("debian.iso.tmp").exists());
    }

    #[test_context(BuildTreeTestContext)]
    #[test]
    fn test_build_iso_missing_tools(ctx: &mut BuildTreeTestContext) {
        let runner = RecordingRunner::new();
        runner.set_missing(Tool::Genisoimage);

        assert!(matches!(
            build_iso(&runner, &CancelToken::new(), &ctx.build_dir(), &request(ctx)),
            Err(BuildError::Environment(_))
        ));
        assert!(runner.calls().is_empty());
    }
}
