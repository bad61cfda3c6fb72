use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::utils::deserialize_duration;

/// `[nbd]` section: device pool discovery and claim policy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NbdConfig {
    /// `max_part` passed to `modprobe nbd`
    pub max_part: u32,
    /// How many times the device pool is scanned before giving up
    pub connect_retries: u32,
    /// Pause between two exhausted scans
    #[serde(deserialize_with = "deserialize_duration")]
    pub retry_backoff: Duration,
    /// Where per-device claim lock files live
    pub lock_dir: PathBuf,
    /// Device node directory
    pub dev_dir: PathBuf,
    /// sysfs mount point
    pub sys_dir: PathBuf,
    /// Device-mapper node directory used by kpartx
    pub mapper_dir: PathBuf,
}

impl NbdConfig {
    pub const DEFAULT_MAX_PART: u32 = 10;
    pub const DEFAULT_CONNECT_RETRIES: u32 = 3;
    pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(10);
}

impl Default for NbdConfig {
    fn default() -> Self {
        Self {
            max_part: Self::DEFAULT_MAX_PART,
            connect_retries: Self::DEFAULT_CONNECT_RETRIES,
            retry_backoff: Self::DEFAULT_RETRY_BACKOFF,
            lock_dir: PathBuf::from("/run/lock"),
            dev_dir: PathBuf::from("/dev"),
            sys_dir: PathBuf::from("/sys"),
            mapper_dir: PathBuf::from("/dev/mapper"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: NbdConfig = toml::from_str("").unwrap();
        assert_eq!(config, NbdConfig::default());
        assert_eq!(config.connect_retries, 3);
        assert_eq!(config.retry_backoff, Duration::from_secs(10));
    }

    #[test]
    fn test_override_retry_policy() {
        let config: NbdConfig = toml::from_str(
            r#"
            connect_retries = 5
            retry_backoff = "2s"
            lock_dir = "/tmp/locks"
            "#,
        )
        .unwrap();
        assert_eq!(config.connect_retries, 5);
        assert_eq!(config.retry_backoff, Duration::from_secs(2));
        assert_eq!(config.lock_dir, PathBuf::from("/tmp/locks"));
        assert_eq!(config.max_part, NbdConfig::DEFAULT_MAX_PART);
    }
}
