//! Shim configuration: the TOML file under the config directory and the
//! command line surface.

pub mod cli;

use std::env;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::exclusion::DEFAULT_EXCLUSION_FILE;

pub use cli::*;

/// Overrides the directory holding `xilinx-container-runtime/config.toml`.
pub const CONFIG_HOME_ENV: &str = "XCRT_CONFIG_HOME";
pub const DEFAULT_CONFIG_HOME: &str = "/etc";
pub const CONFIG_FILE: &str = "xilinx-container-runtime/config.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "xilinx-container-runtime")]
    pub runtime: RuntimeConfig,
    #[serde(rename = "device-exclusion")]
    pub device_exclusion: ExclusionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// File receiving the shim's log output.
    pub debug: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            debug: PathBuf::from("/dev/null"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExclusionConfig {
    /// Exclusive access when a container does not set `XILINX_DEVICE_EXCLUSIVE`.
    pub enabled: bool,
    pub exclusion_file_path: PathBuf,
}

impl Default for ExclusionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            exclusion_file_path: PathBuf::from(DEFAULT_EXCLUSION_FILE),
        }
    }
}

/// Location of the config file, honouring [`CONFIG_HOME_ENV`].
pub fn config_path(config_home: Option<&Path>) -> PathBuf {
    config_home
        .filter(|home| !home.as_os_str().is_empty())
        .unwrap_or(Path::new(DEFAULT_CONFIG_HOME))
        .join(CONFIG_FILE)
}

impl Config {
    /// Load from the default location.
    pub fn load_default() -> Result<Self, Report<ConfigError>> {
        let home = env::var_os(CONFIG_HOME_ENV).map(PathBuf::from);
        Self::load(&config_path(home.as_deref()))
    }

    /// Load `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, Report<ConfigError>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                eprintln!(
                    "config file {} not found, using default config",
                    path.display()
                );
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(Report::new(err).change_context(ConfigError::Read {
                    path: path.to_path_buf(),
                }))
            }
        };
        Self::from_toml(&text).change_context_lazy(|| ConfigError::Parse {
            path: path.to_path_buf(),
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, Report<toml::de::Error>> {
        toml::from_str(text).map_err(Report::new)
    }
}
