//! Ways of filling a freshly mounted disk.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    command::{run_checked, CommandRunner, Tool, ToolCommand},
    error::BuildError,
};

/// Writes the root filesystem into a mounted disk. Implementations must
/// leave the mount point mounted.
pub trait Populate {
    fn populate(&self, mount_point: &Path) -> Result<(), BuildError>;
}

/// Copies a directory tree into the disk, keeping ownership and modes.
pub struct CopyTree {
    source: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl CopyTree {
    pub fn new(runner: Arc<dyn CommandRunner>, source: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
            runner,
        }
    }
}

impl Populate for CopyTree {
    fn populate(&self, mount_point: &Path) -> Result<(), BuildError> {
        log::info!(
            "Copying {} into {}",
            self.source.display(),
            mount_point.display()
        );
        copy_tree_contents(self.runner.as_ref(), &self.source, mount_point)
    }
}

/// `cp -a <src>/. <dst>`: copy the contents of `src`, including dotfiles,
/// into an existing `dst`.
pub(crate) fn copy_tree_contents(
    runner: &dyn CommandRunner,
    src: &Path,
    dst: &Path,
) -> Result<(), BuildError> {
    let mut cmd = ToolCommand::new(Tool::Cp);
    cmd.arg("-a").arg(src.join(".")).arg(dst);
    run_checked(runner, &cmd, |reason| BuildError::ToolFailed {
        tool: Tool::Cp.to_string(),
        reason,
    })?;
    Ok(())
}

/// Unpacks the layers of a `docker save` archive into the disk.
///
/// Every `*.tar` member of the archive is streamed into a second `tar` that
/// extracts it in place, so later layers overwrite earlier ones.
pub struct ContainerArchive {
    archive: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl ContainerArchive {
    pub fn new(runner: Arc<dyn CommandRunner>, archive: &Path) -> Self {
        Self {
            archive: archive.to_path_buf(),
            runner,
        }
    }

    fn script(&self, mount_point: &Path) -> Result<String, BuildError> {
        Ok(format!(
            "cd {} && tar xvfO {} --wildcards --no-anchored '*.tar' | tar xivf -",
            quote(mount_point)?,
            quote(&self.archive)?
        ))
    }
}

impl Populate for ContainerArchive {
    fn populate(&self, mount_point: &Path) -> Result<(), BuildError> {
        if !self.archive.is_file() {
            return Err(BuildError::ArtifactNotFound {
                what: "container archive".to_string(),
                dir: self.archive.clone(),
            });
        }
        log::info!(
            "Extracting {} into {}",
            self.archive.display(),
            mount_point.display()
        );
        let mut cmd = ToolCommand::new(Tool::Bash);
        cmd.arg("-c").arg(self.script(mount_point)?);
        run_checked(self.runner.as_ref(), &cmd, |reason| BuildError::ToolFailed {
            tool: "tar".to_string(),
            reason,
        })?;
        Ok(())
    }
}

/// Quote a path for `bash -c`.
pub(crate) fn quote(path: &Path) -> Result<String, BuildError> {
    let s = path.to_string_lossy();
    shlex::try_quote(&s)
        .map(|q| q.into_owned())
        .map_err(|e| BuildError::Config(format!("cannot quote '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::mock::RecordingRunner;

    #[test]
    fn test_copy_tree() {
        let runner = Arc::new(RecordingRunner::new());
        CopyTree::new(runner.clone(), Path::new("/build/debian.stage1"))
            .populate(Path::new("/tmp/vmbuild_mount_x"))
            .unwrap();
        assert_eq!(
            runner.calls()[0].get_args(),
            &["-a", "/build/debian.stage1/.", "/tmp/vmbuild_mount_x"]
        );
    }

    #[test]
    fn test_container_archive_script() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("my image.tar");
        std::fs::write(&archive, "").unwrap();

        let runner = Arc::new(RecordingRunner::new());
        ContainerArchive::new(runner.clone(), &archive)
            .populate(Path::new("/tmp/vmbuild_mount_x"))
            .unwrap();

        let call = &runner.calls()[0];
        assert_eq!(call.tool(), Tool::Bash);
        assert_eq!(call.get_args()[0], "-c");
        let script = &call.get_args()[1];
        assert!(script.starts_with("cd "), "{}", script);
        assert!(script.contains(" && tar xvfO "), "{}", script);
        assert!(script.contains("--wildcards --no-anchored '*.tar'"), "{}", script);
        let words = shlex::split(script.split(" && ").nth(1).unwrap()).unwrap();
        assert_eq!(words[2], archive.display().to_string());
        assert!(script.ends_with("| tar xivf -"), "{}", script);
    }

    #[test]
    fn test_container_archive_missing() {
        let runner = Arc::new(RecordingRunner::new());
        let err = ContainerArchive::new(runner.clone(), Path::new("/nonexistent/image.tar"))
            .populate(Path::new("/tmp/vmbuild_mount_x"))
            .unwrap_err();
        assert!(matches!(err, BuildError::ArtifactNotFound { .. }));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_quote_paths_with_spaces() {
        let quoted = quote(Path::new("/tmp/a b")).unwrap();
        assert_eq!(shlex::split(&quoted).unwrap(), vec!["/tmp/a b".to_string()]);
    }
}
