use std::{fs, path::PathBuf};

use tempfile::TempDir;
use test_context::TestContext;

/// A scratch workspace holding a fake root filesystem tree, an isolinux
/// support directory and an empty output directory.
///
/// Everything lives under a temporary directory that is removed on teardown.
pub struct BuildTreeTestContext {
    scratch: TempDir,
}

impl BuildTreeTestContext {
    const BUILD_DIR: &'static str = "debian.stage1";
    const ISOLINUX_DIR: &'static str = "isolinux";
    const OUTPUT_DIR: &'static str = "out";

    pub const KERNEL_NAME: &'static str = "vmlinuz-6.1.0-amd64";
    pub const INITRD_NAME: &'static str = "initrd.img-6.1.0-amd64";

    /// 获取临时工作区的根目录
    pub fn scratch_path(&self) -> PathBuf {
        self.scratch.path().to_path_buf()
    }

    /// 获取假的根文件系统目录
    pub fn build_dir(&self) -> PathBuf {
        self.scratch.path().join(Self::BUILD_DIR)
    }

    pub fn boot_dir(&self) -> PathBuf {
        self.build_dir().join("boot")
    }

    pub fn isolinux_dir(&self) -> PathBuf {
        self.scratch.path().join(Self::ISOLINUX_DIR)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.scratch.path().join(Self::OUTPUT_DIR)
    }

    /// Remove every file under `boot/`
    pub fn clear_boot_dir(&self) {
        fs::remove_dir_all(self.boot_dir()).expect("Failed to remove boot dir");
        fs::create_dir_all(self.boot_dir()).expect("Failed to recreate boot dir");
    }

    fn populate(&self) {
        let build_dir = self.build_dir();
        for dir in ["boot", "etc", "bin"] {
            fs::create_dir_all(build_dir.join(dir)).expect("Failed to create build tree");
        }
        fs::write(self.boot_dir().join(Self::KERNEL_NAME), b"kernel").unwrap();
        fs::write(self.boot_dir().join(Self::INITRD_NAME), b"initrd").unwrap();
        fs::write(build_dir.join("etc/hostname"), b"vm\n").unwrap();

        fs::create_dir_all(self.isolinux_dir()).unwrap();
        for file in ["isolinux.bin", "ldlinux.c32", "isolinux.cfg"] {
            fs::write(self.isolinux_dir().join(file), file.as_bytes()).unwrap();
        }

        fs::create_dir_all(self.output_dir()).unwrap();
    }
}

impl TestContext for BuildTreeTestContext {
    fn setup() -> Self {
        env_logger::try_init_from_env(env_logger::Env::default().default_filter_or("info")).ok();

        let scratch = tempfile::Builder::new()
            .prefix("vmbuild-test-")
            .tempdir()
            .expect("Failed to create scratch dir");
        let ctx = BuildTreeTestContext { scratch };
        ctx.populate();
        log::debug!("BuildTreeTestContext setup: {}", ctx.scratch_path().display());
        ctx
    }
}
