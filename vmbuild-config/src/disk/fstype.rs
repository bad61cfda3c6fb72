use serde::{Deserialize, Deserializer};

/// Possible filesystem types for the root partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsType {
    #[default]
    Ext4,
    Ext3,
}

impl FsType {
    /// Value passed to `mkfs -t`
    pub fn mkfs_type(&self) -> &'static str {
        match self {
            FsType::Ext4 => "ext4",
            FsType::Ext3 => "ext3",
        }
    }
}

impl std::fmt::Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mkfs_type())
    }
}

impl<'de> Deserialize<'de> for FsType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut s = String::deserialize(deserializer)?;
        s.make_ascii_lowercase();
        match s.as_str() {
            "ext4" => Ok(FsType::Ext4),
            "ext3" => Ok(FsType::Ext3),
            _ => Err(serde::de::Error::custom("invalid fs type")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{self, Value};

    fn deserialize_fs_type(input: &str) -> Result<FsType, serde_json::Error> {
        let json = Value::String(input.to_string());
        serde_json::from_value(json)
    }

    #[test]
    fn test_deserialize_ext4_lowercase() {
        let fs_type = deserialize_fs_type("ext4").unwrap();
        assert_eq!(fs_type, FsType::Ext4);
        assert_eq!(fs_type.mkfs_type(), "ext4");
    }

    #[test]
    fn test_deserialize_ext3_mixed_case() {
        let fs_type = deserialize_fs_type("EXT3").unwrap();
        assert_eq!(fs_type, FsType::Ext3);
    }

    #[test]
    fn test_deserialize_random_string() {
        assert!(deserialize_fs_type("fat32").is_err());
    }
}
