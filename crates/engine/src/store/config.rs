//! Store configuration via `rackdb.toml`
//!
//! Every field has a default, so an empty file (or no file at all) yields
//! a working configuration.

use rackdb_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Conventional config file name placed next to the record file.
pub const CONFIG_FILE_NAME: &str = "rackdb.toml";

/// Default size at or below which query results are materialized.
pub const DEFAULT_MATERIALIZE_THRESHOLD: usize = 256;

/// When record writes reach stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Rely on the OS to flush; the TOC is synced on checkpoint and close.
    Standard,
    /// fsync after every mutation.
    Always,
}

/// Store configuration loaded from `rackdb.toml`.
///
/// # Example
///
/// ```toml
/// durability = "always"
/// materialize_threshold = 1024
/// lock_timeout_ms = 500
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Durability mode: `"standard"` or `"always"`.
    #[serde(default = "default_durability")]
    pub durability: String,
    /// Queries over at most this many entries decode them eagerly.
    #[serde(default = "default_materialize_threshold")]
    pub materialize_threshold: usize,
    /// Write the TOC into the file on close so the next open skips the scan.
    #[serde(default = "default_true")]
    pub persist_toc_on_close: bool,
    /// Rebuild a missing TOC on a worker thread instead of inside `open`.
    #[serde(default = "default_true")]
    pub background_rebuild: bool,
    /// Default bound for `get_with`/`update_with`/`delete_with` when the caller sets none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_timeout_ms: Option<u64>,
    /// Worker threads for background work.
    #[serde(default = "default_scheduler_threads")]
    pub scheduler_threads: usize,
}

fn default_durability() -> String {
    "standard".to_string()
}

fn default_materialize_threshold() -> usize {
    DEFAULT_MATERIALIZE_THRESHOLD
}

fn default_true() -> bool {
    true
}

fn default_scheduler_threads() -> usize {
    1
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            durability: default_durability(),
            materialize_threshold: DEFAULT_MATERIALIZE_THRESHOLD,
            persist_toc_on_close: true,
            background_rebuild: true,
            lock_timeout_ms: None,
            scheduler_threads: default_scheduler_threads(),
        }
    }
}

impl StoreConfig {
    /// Config suited to tests: synchronous rebuild, no fsync per write.
    pub fn for_testing() -> Self {
        Self {
            background_rebuild: false,
            ..Self::default()
        }
    }

    /// Parse the durability string.
    ///
    /// # Errors
    ///
    /// `Config` unless the string is `"standard"` or `"always"`.
    pub fn durability_mode(&self) -> Result<Durability> {
        match self.durability.as_str() {
            "standard" => Ok(Durability::Standard),
            "always" => Ok(Durability::Always),
            other => Err(Error::Config(format!(
                "invalid durability mode '{}'; expected \"standard\" or \"always\"",
                other
            ))),
        }
    }

    /// Default lock wait bound, if configured.
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    /// Check every field.
    pub fn validate(&self) -> Result<()> {
        self.durability_mode()?;
        if self.scheduler_threads == 0 {
            return Err(Error::Config(
                "scheduler_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The default config file content, with comments.
    pub fn default_toml() -> &'static str {
        r#"# rackdb store configuration
#
# Durability mode: "standard" (default) or "always"
#   "standard" = the OS flushes writes; the TOC is synced on checkpoint/close
#   "always"   = fsync after every add, update and delete
durability = "standard"

# Queries over at most this many entries are decoded eagerly; larger ones stream.
materialize_threshold = 256

# Persist the TOC on close so the next open does not scan the file.
persist_toc_on_close = true

# Rebuild a missing TOC in the background instead of blocking open.
background_rebuild = true

# Bound lock waits in get/update/delete (milliseconds). Unset = wait forever.
# lock_timeout_ms = 1000

scheduler_threads = 1
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// `Config` if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: StoreConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize this config to TOML and write it to `path`.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
