//! dynffi Configuration
//!
//! Handles parsing and management of dynffi.toml configuration files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ffi::CallingConvention;

/// File name searched for by [`DynffiConfig::find_and_load`].
pub const CONFIG_FILE_NAME: &str = "dynffi.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching dynffi.toml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DynffiConfig {
    /// Library search and symbol caching
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Call defaults
    #[serde(default)]
    pub calls: CallsConfig,

    /// Log filter
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DynffiConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: DynffiConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from the current directory or parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        let cwd = std::env::current_dir()?;
        Self::find_and_load(&cwd)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                return Ok(Self::default());
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Library loader settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Extra directories searched for bare library names
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    /// Also search the platform default directories
    #[serde(default = "default_true")]
    pub system_paths: bool,

    /// Remember resolved symbol addresses per library
    #[serde(default = "default_true")]
    pub cache_symbols: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            system_paths: true,
            cache_symbols: true,
        }
    }
}

/// Call settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallsConfig {
    /// Convention used by calls that do not name one
    #[serde(default)]
    pub default_convention: CallingConvention,

    /// Reject conventions the target has no distinct ABI for
    #[serde(default)]
    pub strict_conventions: bool,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DynffiConfig::default();
        assert!(config.loader.system_paths);
        assert!(config.loader.cache_symbols);
        assert_eq!(config.calls.default_convention, CallingConvention::Cdecl);
        assert!(!config.calls.strict_conventions);
        assert_eq!(config.logging.filter, "warn");
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
[loader]
search_paths = ["/opt/native/lib"]
system_paths = false

[calls]
default_convention = "stdcall"
"#;

        let config: DynffiConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.loader.search_paths, vec![PathBuf::from("/opt/native/lib")]);
        assert!(!config.loader.system_paths);
        assert!(config.loader.cache_symbols);
        assert_eq!(config.calls.default_convention, CallingConvention::Stdcall);
        assert_eq!(config.logging.filter, "warn");
    }

    #[test]
    fn test_parse_rejects_unknown_convention() {
        let toml_str = r#"
[calls]
default_convention = "fastcall"
"#;
        assert!(toml::from_str::<DynffiConfig>(toml_str).is_err());
    }

    #[test]
    fn test_find_and_load_walks_up() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let mut config = DynffiConfig::default();
        config.logging.filter = "dynffi=debug".to_string();
        config.save(&root.path().join(CONFIG_FILE_NAME)).unwrap();

        let found = DynffiConfig::find_and_load(&nested).unwrap();
        assert_eq!(found, config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = DynffiConfig::load(&dir.path().join(CONFIG_FILE_NAME)).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
