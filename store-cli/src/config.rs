use serde_derive::{Deserialize, Serialize};

/// Persisted CLI defaults, loaded with `confy` from the platform config
/// directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLoad {
    /// Default store root used when a subcommand omits `--root`.
    pub default_root: Option<String>,

    /// Default `log` level passed to `trace::init_logging`.
    pub log_level: Option<String>,
}

impl Default for ConfigLoad {
    fn default() -> Self {
        ConfigLoad { default_root: None, log_level: Some("info".to_string()) }
    }
}

impl ConfigLoad {
    pub fn load() -> Self {
        confy::load("storecli", None).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_an_info_log_level() {
        assert_eq!(ConfigLoad::default().log_level.as_deref(), Some("info"));
    }
}
