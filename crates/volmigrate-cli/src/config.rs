//! Optional configuration file
//!
//! Defaults for images, strategy order, key algorithm, timeouts and the
//! transfer retry budget can be kept in a YAML file:
//!
//! ```yaml
//! strategies: [mnt2, svc, lbsvc]
//! rsyncImage: registry.example.com/volmigrate-rsync:1.0
//! timeouts:
//!   readySecs: 600
//! transfer:
//!   maxAttempts: 20
//! ```
//!
//! Resolution (highest priority first):
//! 1. Command-line flag
//! 2. `VOLMIGRATE_*` environment variable
//! 3. The file (`--config`, else `~/.volmigrate.yaml`)
//! 4. Built-in default
//!
//! A missing default file is fine; a missing or broken explicit file is not.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;
use volmigrate_core::Options;

use crate::{Error, Result};

const CONFIG_FILE_NAME: &str = ".volmigrate.yaml";

/// Wait bounds, in seconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TimeoutsConfig {
    pub ready_secs: Option<u64>,
    pub address_secs: Option<u64>,
    pub completion_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
}

/// Transfer protocol retry budget
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransferConfig {
    pub max_attempts: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
}

/// Contents of the configuration file. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    pub strategies: Option<Vec<String>>,
    pub rsync_image: Option<String>,
    pub sshd_image: Option<String>,
    pub ssh_key_algorithm: Option<String>,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Path to `~/.volmigrate.yaml`
pub fn default_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_FILE_NAME))
}

fn read(path: &Path) -> Result<FileConfig> {
    let data = std::fs::read_to_string(path).map_err(|source| Error::ReadConfig {
        path: path.to_path_buf(),
        source,
    })?;
    if data.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    let config: FileConfig = serde_yaml::from_str(&data).map_err(|source| Error::ParseConfig {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

/// Load the configuration file.
///
/// `explicit` must exist. Without it, `~/.volmigrate.yaml` is read if present.
pub fn load(explicit: Option<&Path>) -> Result<FileConfig> {
    if let Some(path) = explicit {
        debug!(path = %path.display(), "loading configuration file");
        return read(path);
    }

    match default_path() {
        Some(path) if path.exists() => {
            debug!(path = %path.display(), "loading configuration file");
            read(&path)
        }
        _ => Ok(FileConfig::default()),
    }
}

impl FileConfig {
    /// Reject values that would make waits spin or transfers never run
    pub fn validate(&self) -> Result<()> {
        if self.timeouts.poll_interval_secs == Some(0) {
            return Err(Error::validation("timeouts.pollIntervalSecs must be at least 1"));
        }
        if self.transfer.max_attempts == Some(0) {
            return Err(Error::validation("transfer.maxAttempts must be at least 1"));
        }
        Ok(())
    }

    /// Overlay the file's values onto `options`
    pub fn apply(&self, options: &mut Options) {
        if let Some(strategies) = &self.strategies {
            options.strategies = Some(strategies.clone());
        }
        if let Some(image) = &self.rsync_image {
            options.rsync_image = image.clone();
        }
        if let Some(image) = &self.sshd_image {
            options.sshd_image = image.clone();
        }
        if let Some(algorithm) = &self.ssh_key_algorithm {
            options.key_algorithm = algorithm.clone();
        }

        let timeouts = &mut options.timeouts;
        let secs = Duration::from_secs;
        if let Some(s) = self.timeouts.ready_secs {
            timeouts.ready = secs(s);
        }
        if let Some(s) = self.timeouts.address_secs {
            timeouts.address = secs(s);
        }
        if let Some(s) = self.timeouts.completion_secs {
            timeouts.completion = secs(s);
        }
        if let Some(s) = self.timeouts.poll_interval_secs {
            timeouts.poll_interval = secs(s);
        }

        let transfer = &mut options.transfer;
        if let Some(n) = self.transfer.max_attempts {
            transfer.max_attempts = n;
        }
        if let Some(s) = self.transfer.retry_delay_secs {
            transfer.delay = secs(s);
        }
        if let Some(s) = self.transfer.connect_timeout_secs {
            transfer.connect_timeout = secs(s);
        }
    }
}
