use serde::Deserialize;

/// `[postbuild]` section: shell scripts run inside the build tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PostBuildConfig {
    /// Each script is run with `bash` under `chroot`, in order
    pub scripts: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_in_order() {
        let config: PostBuildConfig = toml::from_str(
            r#"
            scripts = [
                "apt-get clean",
                """
                echo vm > /etc/hostname
                passwd -d root
                """,
            ]
            "#,
        )
        .unwrap();
        assert_eq!(config.scripts.len(), 2);
        assert_eq!(config.scripts[0], "apt-get clean");
        assert!(config.scripts[1].contains("passwd -d root"));
    }

    #[test]
    fn test_default_is_empty() {
        let config: PostBuildConfig = toml::from_str("").unwrap();
        assert!(config.scripts.is_empty());
    }
}
