//! Host configuration.
//!
//! The core consumes a single environment key (`egress.blocklist.file`);
//! everything else has compiled-in defaults that the CLI can override.

use crate::constants::{
    BLOCKLIST_ENV_KEY, BLOCKLIST_RELOAD_INTERVAL, DEFAULT_BLOCKLIST_FILE, DEFAULT_HTTP_PORT,
    STATE_DIR,
};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for one host process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for persisted functions and resources.
    pub state_dir: PathBuf,
    /// Path to the binary egress blocklist.
    pub blocklist_file: PathBuf,
    /// Poll interval of the background blocklist reloader.
    pub reload_interval: Duration,
    /// HTTP listen port.
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(STATE_DIR),
            blocklist_file: PathBuf::from(DEFAULT_BLOCKLIST_FILE),
            reload_interval: BLOCKLIST_RELOAD_INTERVAL,
            port: DEFAULT_HTTP_PORT,
        }
    }
}

impl Config {
    /// Builds a config from the environment.
    ///
    /// Only `egress.blocklist.file` is consulted; absence keeps the default
    /// `blocklist.bin` next to the working directory.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var(BLOCKLIST_ENV_KEY)
            && !path.trim().is_empty()
        {
            config.blocklist_file = PathBuf::from(path);
        }
        config
    }

    /// Directory holding function asset documents.
    pub fn functions_dir(&self) -> PathBuf {
        self.state_dir.join(crate::constants::FUNCTIONS_DIR)
    }

    /// Directory holding resource record documents.
    pub fn resources_dir(&self) -> PathBuf {
        self.state_dir.join(crate::constants::RESOURCES_DIR)
    }
}
