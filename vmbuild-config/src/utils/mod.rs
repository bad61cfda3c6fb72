use std::time::Duration;

use serde::{Deserialize, Deserializer};

pub mod size;

/// Deserialize a human readable duration such as `"10s"` or `"500ms"`.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}
