//! Configuration file management for huddle.
//!
//! Provides a TOML-based config file at `~/.config/huddle/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use huddle_core::EngineConfig;
use huddle_core::ranker::DEFAULT_MAX_CANDIDATES;
use huddle_db::config::DbConfig;

/// Environment variable overriding `[engine] max_candidates`.
pub const MAX_CANDIDATES_ENV: &str = "HUDDLE_MAX_CANDIDATES";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub engine: EngineSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_candidates: DEFAULT_MAX_CANDIDATES,
        }
    }
}

fn default_max_candidates() -> usize {
    DEFAULT_MAX_CANDIDATES
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the huddle config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/huddle` or `~/.config/huddle`,
/// including on macOS.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("huddle");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("huddle")
}

/// Return the path to the huddle config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    load_config_from(&config_path())
}

pub fn load_config_from(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix since the URL may carry a password.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    save_config_to(config, &config_path())
}

pub fn save_config_to(config: &ConfigFile, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct HuddleConfig {
    pub db_config: DbConfig,
    pub engine: EngineConfig,
}

impl HuddleConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - DB URL: `cli_db_url` > `HUDDLE_DATABASE_URL` > `database.url` > `DbConfig::DEFAULT_URL`
    /// - Candidates: `cli_max_candidates` > `HUDDLE_MAX_CANDIDATES` > `engine.max_candidates` > 5
    pub fn resolve(cli_db_url: Option<&str>, cli_max_candidates: Option<usize>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var(DbConfig::ENV_VAR) {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };

        let max_candidates = if let Some(n) = cli_max_candidates {
            n
        } else if let Ok(raw) = std::env::var(MAX_CANDIDATES_ENV) {
            raw.trim()
                .parse()
                .with_context(|| format!("{MAX_CANDIDATES_ENV}={raw:?} is not a number"))?
        } else if let Some(ref cfg) = file_config {
            cfg.engine.max_candidates
        } else {
            DEFAULT_MAX_CANDIDATES
        };
        if max_candidates == 0 {
            bail!("max_candidates must be at least 1");
        }

        Ok(Self {
            db_config: DbConfig::new(db_url),
            engine: EngineConfig { max_candidates },
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
