pub mod format;
pub mod fstype;

use std::path::PathBuf;

use format::DiskFormat;
use fstype::FsType;
use serde::Deserialize;

use crate::utils::size::{deserialize_size, DiskSize};

/// `[disk]` section of the manifest
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// 磁盘镜像格式
    pub format: DiskFormat,
    /// 磁盘镜像大小
    #[serde(deserialize_with = "deserialize_size")]
    pub size: DiskSize,
    /// 根分区文件系统类型
    pub fs_type: FsType,
    /// Master boot record written to the finished disk (optional)
    pub mbr: Option<PathBuf>,
}
