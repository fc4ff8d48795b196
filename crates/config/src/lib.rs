//! Layered configuration for glint.
//!
//! Values are merged in order, later sources winning:
//!
//! 1. Built-in defaults ([`Config::default`]),
//! 2. `glint.toml` in the platform configuration directory (if present),
//! 3. an explicitly supplied file (TOML, YAML or JSON, picked by extension),
//! 4. `GLINT_`-prefixed environment variables, using `__` to separate
//!    nested keys (e.g. `GLINT_BUFFER__MAX_BUFFER_COUNT=8`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::instrument;

const ENV_PREFIX: &str = "GLINT_";
const CONFIG_FILE_NAME: &str = "glint.toml";
const DATABASE_FILE_NAME: &str = "glint.sqlite3";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "glint")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub buffer: BufferConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database holding both the primary `media` table and the
    /// materialized buffers.
    pub path: PathBuf,
}
impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = project_dirs()
            .map(|dirs| dirs.data_dir().join(DATABASE_FILE_NAME))
            .unwrap_or_else(|| PathBuf::from(DATABASE_FILE_NAME));
        Self { path }
    }
}

/// Bounds and tuning for the buffer engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Upper bound on the combined (estimated) size of all buffers.
    pub max_total_size_bytes: u64,
    /// Upper bound on the number of Ready buffers.
    pub max_buffer_count: u32,
    /// Page size used when the caller doesn't ask for one.
    pub default_page_size: u32,
    /// Requested page sizes are clamped to `1..=max_page_size`.
    pub max_page_size: u32,
    /// Builds running longer than this are cancelled.
    pub build_timeout_secs: u64,
    /// Consecutive record source failures before the service reports itself
    /// as degraded.
    pub degraded_after_failures: u32,
    /// Rows inserted per prepared-statement batch while materializing.
    pub insert_batch_size: u32,
}
impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_total_size_bytes: 256 * 1024 * 1024,
            max_buffer_count: 32,
            default_page_size: 50,
            max_page_size: 200,
            build_timeout_secs: 120,
            degraded_after_failures: 3,
            insert_batch_size: 500,
        }
    }
}
impl BufferConfig {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

impl Config {
    /// Load the configuration from every layer, optionally including an
    /// explicit file that must exist.
    #[instrument]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(dirs) = project_dirs() {
            // Missing files are skipped by figment, which is what we want for
            // the implicit user-level file.
            figment = figment.merge(Toml::file(dirs.config_dir().join(CONFIG_FILE_NAME)));
        }
        if let Some(path) = path {
            if !path.is_file() {
                exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
            }
            figment = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => figment.merge(Toml::file(path)),
            };
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    /// Extract and validate a configuration from an already assembled figment.
    pub fn extract(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().or_raise(|| ErrorKind::Invalid)?;
        config.validate()?;
        tracing::debug!(database = %config.database.path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let buffer = &self.buffer;
        if buffer.max_total_size_bytes == 0 {
            exn::bail!(ErrorKind::Validation("buffer.max_total_size_bytes must be positive".to_string()));
        }
        if buffer.max_buffer_count == 0 {
            exn::bail!(ErrorKind::Validation("buffer.max_buffer_count must be positive".to_string()));
        }
        if buffer.max_page_size == 0 || buffer.default_page_size == 0 {
            exn::bail!(ErrorKind::Validation("page sizes must be positive".to_string()));
        }
        if buffer.default_page_size > buffer.max_page_size {
            exn::bail!(ErrorKind::Validation(format!(
                "buffer.default_page_size ({}) exceeds buffer.max_page_size ({})",
                buffer.default_page_size, buffer.max_page_size
            )));
        }
        if buffer.build_timeout_secs == 0 {
            exn::bail!(ErrorKind::Validation("buffer.build_timeout_secs must be positive".to_string()));
        }
        if buffer.insert_batch_size == 0 {
            exn::bail!(ErrorKind::Validation("buffer.insert_batch_size must be positive".to_string()));
        }
        Ok(())
    }
}
