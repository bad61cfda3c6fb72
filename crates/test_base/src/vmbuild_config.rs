use std::path::PathBuf;

use test_context::TestContext;

#[derive(Debug, Clone)]
pub struct VmBuildConfigTestContext {
    /// vmbuild-config 包的根目录
    test_base_path: PathBuf,
}

impl VmBuildConfigTestContext {
    /// 获取 vmbuild-config 包的根目录
    pub fn test_base_path(&self) -> &PathBuf {
        &self.test_base_path
    }

    /// 获取包目录下的文件的绝对路径
    pub fn abs_path(&self, relative_path: &str) -> PathBuf {
        self.test_base_path.join(relative_path)
    }

    /// 获取配置模版的路径
    pub fn templates_dir(&self) -> PathBuf {
        const TEMPLATES_DIR: &str = "templates";
        self.abs_path(TEMPLATES_DIR)
    }
}

impl TestContext for VmBuildConfigTestContext {
    fn setup() -> Self {
        env_logger::try_init_from_env(env_logger::Env::default().default_filter_or("info")).ok();

        // 获取 vmbuild-config 包的根目录
        let mut test_base_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        test_base_path.pop();
        test_base_path.pop();
        test_base_path.push("vmbuild-config");
        log::debug!(
            "VmBuildConfigTestContext setup: test_base_path={:?}",
            test_base_path
        );

        VmBuildConfigTestContext { test_base_path }
    }
}
