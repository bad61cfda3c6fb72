use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Result;
use serde::Deserialize;

use crate::{disk::DiskConfig, iso::IsoConfig, nbd::NbdConfig, postbuild::PostBuildConfig};

/// Target name used when neither the manifest nor the build path provide one
pub const FALLBACK_TARGET_NAME: &str = "vmbuild";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Metadata {
    /// Output name; derived from the build path when unset
    pub target: Option<String>,
    /// Directory where finished artifacts are written
    pub output_dir: PathBuf,
    /// Distribution mirror, consumed by the bootstrap step
    pub mirror: String,
    /// Distribution branch, consumed by the bootstrap step
    pub branch: String,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            target: None,
            output_dir: PathBuf::from("."),
            mirror: "http://mirrors.ocf.berkeley.edu/debian".to_string(),
            branch: "testing".to_string(),
        }
    }
}

/// vmbuild manifest file (`vmbuild.toml`)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VmBuildManifest {
    pub metadata: Metadata,
    pub disk: DiskConfig,
    pub iso: IsoConfig,
    pub nbd: NbdConfig,
    pub postbuild: PostBuildConfig,
}

impl VmBuildManifest {
    pub fn load(path: &Path) -> Result<Self> {
        // 读取文件内容
        let content = fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> Result<Self> {
        let manifest: VmBuildManifest = toml::from_str(content)?;
        log::trace!("Loaded manifest: {:?}", manifest);
        Ok(manifest)
    }

    /// Name of the artifacts produced from `build_path`.
    ///
    /// The manifest's `target` wins; otherwise the build directory's basename
    /// up to its first `.` is used (`debian.stage1` -> `debian`).
    pub fn target_name(&self, build_path: &Path) -> String {
        if let Some(target) = self.metadata.target.as_ref().filter(|t| !t.is_empty()) {
            return target.clone();
        }
        default_target_name(build_path)
    }
}

/// Derive a target name from the basename of a build path.
pub fn default_target_name(build_path: &Path) -> String {
    build_path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.split('.').next())
        .filter(|name| !name.is_empty())
        .unwrap_or(FALLBACK_TARGET_NAME)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::format::DiskFormat;
    use std::{io::Write, time::Duration};
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_success() -> Result<()> {
        let toml_content = r#"
            [metadata]
            target = "minimal"
            output_dir = "out"

            [disk]
            format = "vmdk"
            size = "4G"

            [nbd]
            retry_backoff = "1s"

            [postbuild]
            scripts = ["apt-get clean"]
        "#;

        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(toml_content.as_bytes())?;

        let manifest = VmBuildManifest::load(temp_file.path())?;

        assert_eq!(manifest.metadata.target.as_deref(), Some("minimal"));
        assert_eq!(manifest.metadata.output_dir, PathBuf::from("out"));
        assert_eq!(manifest.disk.format, DiskFormat::Vmdk);
        assert_eq!(manifest.disk.size.as_str(), "4G");
        assert_eq!(manifest.nbd.retry_backoff, Duration::from_secs(1));
        assert_eq!(manifest.nbd.connect_retries, 3);
        assert_eq!(manifest.postbuild.scripts, vec!["apt-get clean".to_string()]);

        Ok(())
    }

    #[test]
    fn test_load_empty_uses_defaults() -> Result<()> {
        let manifest = VmBuildManifest::load_from_str("")?;
        assert_eq!(manifest.metadata.output_dir, PathBuf::from("."));
        assert_eq!(manifest.metadata.branch, "testing");
        assert_eq!(manifest.disk.format, DiskFormat::Qcow2);
        assert_eq!(manifest.iso.isolinux_dir, PathBuf::from("misc/isolinux/"));
        assert!(manifest.postbuild.scripts.is_empty());
        Ok(())
    }

    #[test]
    fn test_load_file_not_found() {
        let result = VmBuildManifest::load(Path::new("non_existent_file.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let result = VmBuildManifest::load_from_str("[metadata\ntarget = \"x\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_format() {
        let result = VmBuildManifest::load_from_str("[disk]\nformat = \"abcde\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_target_name_from_manifest() {
        let manifest = VmBuildManifest::load_from_str("[metadata]\ntarget = \"named\"").unwrap();
        assert_eq!(manifest.target_name(Path::new("/tmp/debian.stage1")), "named");
    }

    #[test]
    fn test_target_name_from_build_path() {
        let manifest = VmBuildManifest::default();
        assert_eq!(manifest.target_name(Path::new("/tmp/debian.stage1")), "debian");
        assert_eq!(manifest.target_name(Path::new("/tmp/plain")), "plain");
        assert_eq!(manifest.target_name(Path::new("/")), FALLBACK_TARGET_NAME);
        assert_eq!(manifest.target_name(Path::new("/tmp/.hidden")), FALLBACK_TARGET_NAME);
    }
}
