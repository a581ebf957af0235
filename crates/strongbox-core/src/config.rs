use crate::error::{Error, Result};
use crate::pattern::PathPattern;
use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// How far below an item's root folder the walk descends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubfolderMode {
    /// Every nested folder.
    #[default]
    All,
    /// Files of the root folder only.
    This,
    /// The root folder is registered but nothing inside it.
    None,
}

/// One configured source folder.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupItem {
    /// Display name; becomes the root folder's name in the catalog.
    pub name: String,
    pub folder: PathBuf,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub subfolders: SubfolderMode,
}

impl BackupItem {
    pub fn new(name: &str, folder: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            folder: folder.into(),
            exclude_patterns: Vec::new(),
            subfolders: SubfolderMode::All,
        }
    }

    pub fn exclude(mut self, pattern: &str) -> Self {
        self.exclude_patterns.push(pattern.to_string());
        self
    }

    pub fn with_subfolders(mut self, mode: SubfolderMode) -> Self {
        self.subfolders = mode;
        self
    }

    pub fn compile_patterns(&self) -> Result<Vec<PathPattern>> {
        self.exclude_patterns
            .iter()
            .map(|p| PathPattern::new(p))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub destination: Option<PathBuf>,
    #[serde(default)]
    pub items: Vec<BackupItem>,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default = "default_reader_idle_secs")]
    pub reader_idle_secs: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("strongbox")
}

fn default_reader_idle_secs() -> u64 {
    10
}

fn default_flush_interval_ms() -> u64 {
    250
}

impl AppConfig {
    pub fn destination(&self) -> Result<&PathBuf> {
        self.destination
            .as_ref()
            .ok_or_else(|| Error::Other("no destination configured".to_string()))
    }

    pub fn reader_idle(&self) -> Duration {
        Duration::from_secs(self.reader_idle_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    load_configuration_from("Strongbox")
}

/// Reads `name` (any extension the `config` crate knows, optional) with
/// `STRONGBOX_*` environment overrides on top.
pub fn load_configuration_from(name: &str) -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name(name).required(false))
        .add_source(Environment::with_prefix("STRONGBOX"))
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_items_and_defaults() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("Strongbox.toml");
        fs::write(
            &file,
            r#"
destination = "/mnt/backup"

[[items]]
name = "Documents"
folder = "/home/me/docs"
exclude_patterns = ["*.tmp", "cache|"]

[[items]]
name = "Desk"
folder = "/home/me/Desktop"
subfolders = "this"
"#,
        )
        .unwrap();

        let config = load_configuration_from(file.with_extension("").to_str().unwrap()).unwrap();
        assert_eq!(config.destination, Some(PathBuf::from("/mnt/backup")));
        assert_eq!(config.items.len(), 2);
        assert_eq!(config.items[0].subfolders, SubfolderMode::All);
        assert_eq!(config.items[0].exclude_patterns.len(), 2);
        assert_eq!(config.items[1].subfolders, SubfolderMode::This);
        assert_eq!(config.flush_interval(), Duration::from_millis(250));
        assert_eq!(config.reader_idle(), Duration::from_secs(10));
    }

    #[test]
    fn test_missing_file_yields_empty_config() {
        let dir = tempdir().unwrap();
        let config =
            load_configuration_from(dir.path().join("absent").to_str().unwrap()).unwrap();
        assert!(config.items.is_empty());
        assert!(config.destination().is_err());
    }

    #[test]
    fn test_invalid_exclude_pattern_is_reported() {
        let item = BackupItem::new("x", "/x").exclude("");
        assert!(matches!(
            item.compile_patterns(),
            Err(Error::InvalidPattern(_))
        ));
    }
}
