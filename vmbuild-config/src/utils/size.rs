use std::{fmt, str::FromStr};

use serde::Deserializer;

/// Size of a disk image.
///
/// Keeps the text the user wrote (e.g. `"1G"`) because that is what gets
/// handed to `qemu-img create`, together with the number of bytes it means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSize {
    text: String,
    bytes: u64,
}

impl DiskSize {
    /// Text form understood by `qemu-img`
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Default for DiskSize {
    fn default() -> Self {
        DiskSize {
            text: "1G".to_string(),
            bytes: 1024 * 1024 * 1024,
        }
    }
}

impl FromStr for DiskSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        parse_size_from_string(text)
            .map(|bytes| DiskSize {
                text: text.to_string(),
                bytes,
            })
            .ok_or_else(|| format!("invalid disk size: '{}'", s))
    }
}

impl From<u64> for DiskSize {
    fn from(bytes: u64) -> Self {
        DiskSize {
            text: bytes.to_string(),
            bytes,
        }
    }
}

impl fmt::Display for DiskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// 自定义反序列化函数，用于解析表示磁盘镜像大小的值。
///
/// 支持两种输入格式：
/// 1. 纯数字：直接将其视为字节数。
/// 2. 带单位的字符串：如"1M"、"1G"，单位支持K、M、G、T。
pub fn deserialize_size<'de, D>(deserializer: D) -> Result<DiskSize, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde::de::Deserialize::deserialize(deserializer)?;

    match value {
        toml::Value::Integer(num) if num >= 0 => Ok(DiskSize::from(num as u64)),
        toml::Value::String(s) => DiskSize::from_str(&s).map_err(serde::de::Error::custom),
        _ => Err(serde::de::Error::custom("Invalid type for size")),
    }
}

/// Parses a size string with optional unit suffix (K, M, G, T) into bytes.
///
/// Returns `None` for an empty string, a non-integer number or an unknown
/// unit.
fn parse_size_from_string(size_str: &str) -> Option<u64> {
    if size_str.is_empty() {
        return None;
    }
    if size_str.chars().all(|c| c.is_ascii_digit()) {
        return size_str.parse::<u64>().ok();
    }

    let mut chars = size_str.chars().rev();
    let unit = chars.next()?;
    let number_str: String = chars.rev().collect();
    let number = number_str.parse::<u64>().ok()?;

    let shift = match unit.to_ascii_uppercase() {
        'K' => 10,
        'M' => 20,
        'G' => 30,
        'T' => 40,
        _ => return None,
    };
    number.checked_mul(1u64 << shift)
}
