use serde::{Deserialize, Deserializer, Serialize};

/// Disk image format understood by `qemu-img`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskFormat {
    Raw,
    Qcow2,
    Qcow,
    Vmdk,
}

impl DiskFormat {
    /// Accepted format names (keep in sync with the enum)
    pub const EXPECTED: [&'static str; 4] = ["raw", "qcow2", "qcow", "vmdk"];

    /// Whether the image must be exported through a network block device
    /// before it can be partitioned. Raw images are partitioned in place.
    pub fn needs_nbd(&self) -> bool {
        *self != DiskFormat::Raw
    }

    /// File extension of the finished image, also the `qemu-img -f` value
    pub fn extension(&self) -> &'static str {
        (*self).into()
    }
}

impl Default for DiskFormat {
    fn default() -> Self {
        DiskFormat::Qcow2
    }
}

impl TryFrom<&str> for DiskFormat {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(DiskFormat::Raw),
            "qcow2" => Ok(DiskFormat::Qcow2),
            "qcow" => Ok(DiskFormat::Qcow),
            "vmdk" => Ok(DiskFormat::Vmdk),
            _ => Err(format!("unknown disk format: {}", value)),
        }
    }
}

impl Into<&str> for DiskFormat {
    fn into(self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Qcow => "qcow",
            DiskFormat::Vmdk => "vmdk",
        }
    }
}

impl Into<String> for DiskFormat {
    fn into(self) -> String {
        let x: &str = self.into();
        x.to_string()
    }
}

impl std::fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.extension())
    }
}

impl<'de> Deserialize<'de> for DiskFormat {
    fn deserialize<D>(deserializer: D) -> Result<DiskFormat, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        DiskFormat::try_from(s.as_str()).map_err(|_| {
            serde::de::Error::invalid_value(
                serde::de::Unexpected::Str(s.as_str()),
                &format!("Expected one of {:?}", DiskFormat::EXPECTED).as_str(),
            )
        })
    }
}

impl Serialize for DiskFormat {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.extension())
    }
}
