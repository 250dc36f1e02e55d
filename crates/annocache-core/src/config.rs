//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/annocache/config.toml)
//! 3. Environment variables (ANNOCACHE_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::MutationMode;

/// Environment variable prefix
const ENV_PREFIX: &str = "ANNOCACHE";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (annotations file)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// How background propagations are scheduled
    #[serde(default)]
    pub mutation_mode: MutationMode,

    /// Default number of annotations to load per page
    #[serde(default)]
    pub page_size: Option<usize>,

    /// Write logs to this file instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            mutation_mode: MutationMode::default(),
            page_size: None,
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (ANNOCACHE_DATA_DIR, ANNOCACHE_MUTATION_MODE, ANNOCACHE_PAGE_SIZE)
    /// 2. Config file (~/.config/annocache/config.toml or ANNOCACHE_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring a path given on the command line
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = Self::read_file(path)?;
        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Read only what the config file says, without environment overrides
    ///
    /// Use this when editing and saving the file, so temporary environment
    /// values are not written into it. If the file doesn't exist, defaults
    /// are used.
    pub fn read_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // ANNOCACHE_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // ANNOCACHE_MUTATION_MODE
        if let Ok(val) = std::env::var(format!("{}_MUTATION_MODE", ENV_PREFIX)) {
            match val.parse() {
                Ok(mode) => self.mutation_mode = mode,
                Err(e) => warn!("Ignoring {}_MUTATION_MODE: {}", ENV_PREFIX, e),
            }
        }

        // ANNOCACHE_PAGE_SIZE
        if let Ok(val) = std::env::var(format!("{}_PAGE_SIZE", ENV_PREFIX)) {
            if val.is_empty() {
                self.page_size = None;
            } else {
                match val.parse() {
                    Ok(size) => self.page_size = Some(size),
                    Err(e) => warn!("Ignoring {}_PAGE_SIZE: {}", ENV_PREFIX, e),
                }
            }
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with ANNOCACHE_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("annocache")
            .join("config.toml")
    }

    /// Get the path to the annotations file used by the file backend
    pub fn annotations_path(&self) -> PathBuf {
        self.data_dir.join("annotations.json")
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("annocache")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            // Clear all the vars
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "ANNOCACHE_DATA_DIR",
        "ANNOCACHE_MUTATION_MODE",
        "ANNOCACHE_PAGE_SIZE",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mutation_mode, MutationMode::Serialized);
        assert!(config.page_size.is_none());
        assert!(config.log_file.is_none());
        assert!(config.data_dir.ends_with("annocache"));
    }

    #[test]
    fn test_annotations_path() {
        let config = Config::default();
        assert!(config.annotations_path().ends_with("annotations.json"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("ANNOCACHE_DATA_DIR", "/tmp/annocache-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/annocache-test"));
    }

    #[test]
    fn test_env_override_mutation_mode() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("ANNOCACHE_MUTATION_MODE", "concurrent");
        config.apply_env_overrides();
        assert_eq!(config.mutation_mode, MutationMode::Concurrent);

        // Invalid values are ignored
        env::set_var("ANNOCACHE_MUTATION_MODE", "sideways");
        config.apply_env_overrides();
        assert_eq!(config.mutation_mode, MutationMode::Concurrent);
    }

    #[test]
    fn test_env_override_page_size() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("ANNOCACHE_PAGE_SIZE", "25");
        config.apply_env_overrides();
        assert_eq!(config.page_size, Some(25));

        // Empty string clears it
        env::set_var("ANNOCACHE_PAGE_SIZE", "");
        config.apply_env_overrides();
        assert!(config.page_size.is_none());
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/annocache"),
            mutation_mode: MutationMode::Concurrent,
            page_size: Some(50),
            log_file: None,
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("mutation_mode = \"concurrent\""));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(parsed.mutation_mode, config.mutation_mode);
        assert_eq!(parsed.page_size, config.page_size);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            mutation_mode = "serialized"
            page_size = 10
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.mutation_mode, MutationMode::Serialized);
        assert_eq!(config.page_size, Some(10));
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        env::set_var("ANNOCACHE_DATA_DIR", temp_dir.path().join("data"));

        let path = temp_dir.path().join("missing.toml");
        let config = Config::load_from_path(&path).unwrap();
        // Should return defaults when file doesn't exist
        assert_eq!(config.mutation_mode, MutationMode::Serialized);
        assert!(config.data_dir.exists());
    }

    #[test]
    fn test_save_and_reload() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let config = Config {
            data_dir: temp_dir.path().join("data"),
            mutation_mode: MutationMode::Concurrent,
            page_size: Some(5),
            log_file: Some(temp_dir.path().join("debug.log")),
        };
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_with_cli_override(Some(&path)).unwrap();
        assert_eq!(loaded.data_dir, config.data_dir);
        assert_eq!(loaded.mutation_mode, MutationMode::Concurrent);
        assert_eq!(loaded.page_size, Some(5));
        assert_eq!(loaded.log_file, config.log_file);
    }

    #[test]
    fn test_read_file_ignores_env_overrides() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        let saved = Config {
            data_dir: temp_dir.path().join("data"),
            page_size: Some(5),
            ..Config::default()
        };
        saved.save_to_path(&path).unwrap();

        env::set_var("ANNOCACHE_DATA_DIR", "/tmp/annocache-elsewhere");
        env::set_var("ANNOCACHE_MUTATION_MODE", "concurrent");

        let from_file = Config::read_file(&path).unwrap();
        assert_eq!(from_file.data_dir, saved.data_dir);
        assert_eq!(from_file.mutation_mode, MutationMode::Serialized);
        assert_eq!(from_file.page_size, Some(5));

        let effective = Config::load_from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(effective.mutation_mode, MutationMode::Concurrent);
    }
}
