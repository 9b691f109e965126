//! Converter configuration: the three working areas.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory uploads land in.
    pub source_directory: PathBuf,
    /// Staging directory for converted files and the union cache.
    pub working_directory: PathBuf,
    /// Directory the scorer writes result documents to.
    pub output_directory: PathBuf,
}

/// Loads and validates a configuration file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    load_config_from_str(&content)
}

/// Parses and validates configuration from a JSON string.
pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let directories = [
        ("source_directory", &config.source_directory),
        ("working_directory", &config.working_directory),
        ("output_directory", &config.output_directory),
    ];

    for (name, directory) in &directories {
        if directory.as_os_str().is_empty() {
            return Err(ConfigError::Validation {
                message: format!("{name} must not be empty"),
            });
        }
    }

    for (i, (name_a, dir_a)) in directories.iter().enumerate() {
        for (name_b, dir_b) in directories.iter().skip(i + 1) {
            if dir_a == dir_b {
                return Err(ConfigError::Validation {
                    message: format!("{name_a} and {name_b} must be distinct directories"),
                });
            }
        }
    }

    Ok(())
}
