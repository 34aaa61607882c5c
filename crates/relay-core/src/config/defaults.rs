//! Default configuration values

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "relay.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "relay.yaml";

/// Get list of config file names to search for, in priority order
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".relay.toml",
        ".relay.yaml",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_takes_priority() {
        let names = config_file_names();
        assert_eq!(names[0], DEFAULT_CONFIG_TOML);
        assert!(names.iter().position(|n| *n == DEFAULT_CONFIG_TOML)
            < names.iter().position(|n| *n == DEFAULT_CONFIG_YAML));
    }
}
