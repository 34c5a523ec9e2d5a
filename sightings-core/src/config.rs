//! Configuration file management for cimon-sightings.
//!
//! Reads/writes `~/.cimon-sightings/config.toml` with server binding,
//! database path, feed and element sources, and the fallback geolocation.
//! Every field has a default so a partial file is fine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::elements::DEFAULT_ELEMENTS_URL;
use crate::feed::DEFAULT_FEED_URL;
use crate::types::{Result, SightingError};

/// Full configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub feeds: FeedConfig,
    pub elements: ElementsConfig,
    pub geoip: GeoIpConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Feed URL with a `{name}` placeholder for the marker name.
    pub url_template: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementsConfig {
    pub url: String,
    pub refresh_hours: u64,
}

/// Fixed answer for address lookups. Unset means every lookup is "Not Found".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoIpConfig {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub city: Option<String>,
    pub timezone: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 8888,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: "data/sightings.db".into(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            url_template: DEFAULT_FEED_URL.into(),
        }
    }
}

impl Default for ElementsConfig {
    fn default() -> Self {
        ElementsConfig {
            url: DEFAULT_ELEMENTS_URL.into(),
            refresh_hours: 12,
        }
    }
}

/// Get the config directory path (`~/.cimon-sightings/`).
pub fn config_dir() -> PathBuf {
    dirs_home().join(".cimon-sightings")
}

/// Get the config file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load config from `~/.cimon-sightings/config.toml`.
///
/// Returns default config if the file doesn't exist.
pub fn load_config() -> Result<Config> {
    let path = config_file();
    if !path.exists() {
        return Ok(Config::default());
    }
    from_file(&path)
}

/// Load config from an explicit path. A missing file is an error here.
pub fn from_file(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)?;
    parse_config(&text)
        .map_err(|e| SightingError::Config(format!("{}: {e}", path.display())))
}

/// Save config to `~/.cimon-sightings/config.toml`.
pub fn save_config(config: &Config) -> Result<PathBuf> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;

    let path = config_file();
    std::fs::write(&path, serialize_config(config)?)?;

    Ok(path)
}

fn parse_config(text: &str) -> std::result::Result<Config, toml::de::Error> {
    toml::from_str(text)
}

fn serialize_config(config: &Config) -> Result<String> {
    let body = toml::to_string_pretty(config).map_err(|e| SightingError::Config(e.to_string()))?;
    Ok(format!("# cimon-sightings configuration\n\n{body}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
