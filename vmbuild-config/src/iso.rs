use std::path::PathBuf;

use serde::Deserialize;

/// `[iso]` section of the manifest
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IsoConfig {
    /// Directory containing isolinux.bin, ldlinux.c32 and isolinux.cfg
    pub isolinux_dir: PathBuf,
    /// ISO9660 volume id
    pub volume_id: String,
}

impl Default for IsoConfig {
    fn default() -> Self {
        Self {
            isolinux_dir: PathBuf::from("misc/isolinux/"),
            volume_id: "vmbuild".to_string(),
        }
    }
}
