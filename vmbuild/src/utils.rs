use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

/// 检查目录是否存在
pub(crate) fn check_dir_exists(path: &Path) -> Result<&Path> {
    if !path.exists() {
        return Err(anyhow!("Path '{}' not exists", path.display()));
    }
    if !path.is_dir() {
        return Err(anyhow!("Path '{}' is not a directory", path.display()));
    }

    Ok(path)
}

/// 获取给定路径的绝对路径
pub fn abs_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        let origin = std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf());
        origin.canonicalize().unwrap_or(origin)
    }
}

pub struct StdioUtils;

impl StdioUtils {
    /// 将标准错误输出转换为行列表
    pub fn stderr_to_lines(stderr: &[u8]) -> Vec<String> {
        let stderr = String::from_utf8_lossy(stderr);
        stderr.lines().map(|s| s.to_string()).collect()
    }

    /// 获取标准错误输出的最后n行, 以字符串形式返回.
    /// 如果标准错误输出的行数小于n, 则返回所有行.
    pub fn tail_n_str(lines: Vec<String>, n: usize) -> String {
        let mut result = String::new();
        let start = lines.len().saturating_sub(n);
        for line in lines.iter().skip(start) {
            result.push_str(line);
            result.push('\n');
        }
        result
    }
}
