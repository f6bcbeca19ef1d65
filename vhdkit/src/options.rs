//! Configuration for vhdkit.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vhdkit_shared::errors::{VhdkitError, VhdkitResult};

/// Environment variables read by vhdkit.
pub mod envs {
    /// Scratch directory handed to the archive driver.
    pub const VHDKIT_TEMP_DIR: &str = "VHDKIT_TEMP_DIR";
}

/// Directory and file names under the user config directory.
pub mod layout {
    pub const CONFIG_DIR: &str = "vhdkit";
    pub const OPTIONS_FILE: &str = "options.json";
}

/// Library-wide options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VhdkitOptions {
    /// Scratch directory for the archive driver.
    ///
    /// Resolution order: this value, then `VHDKIT_TEMP_DIR`, then the
    /// system temp directory.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Filter used by [`crate::util::init_logging`] when `RUST_LOG` is unset.
    ///
    /// Default: "info"
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for VhdkitOptions {
    fn default() -> Self {
        Self {
            temp_dir: None,
            log_filter: default_log_filter(),
        }
    }
}

impl VhdkitOptions {
    /// Parse options from a JSON string.
    pub fn from_json_str(json: &str) -> VhdkitResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| VhdkitError::Config(format!("invalid options: {e}")))
    }

    /// Load options from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> VhdkitResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            VhdkitError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&content)
    }

    /// Load `<config dir>/vhdkit/options.json`, or defaults when it does not exist.
    pub fn load_default() -> VhdkitResult<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::debug!(path = %path.display(), "Loading vhdkit options");
                Self::from_json_file(path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Location of the user options file, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(layout::CONFIG_DIR).join(layout::OPTIONS_FILE))
    }

    /// Scratch directory for the archive driver.
    pub fn resolve_temp_dir(&self) -> PathBuf {
        self.resolve_temp_dir_with(|key| std::env::var_os(key))
    }

    pub(crate) fn resolve_temp_dir_with<F>(&self, lookup: F) -> PathBuf
    where
        F: FnOnce(&str) -> Option<std::ffi::OsString>,
    {
        if let Some(dir) = &self.temp_dir {
            return dir.clone();
        }
        lookup(envs::VHDKIT_TEMP_DIR)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    }
}
