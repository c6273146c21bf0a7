//! Connection tuning knobs, persisted as a JSON file.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::convert::ATMOSPHERIC_KPA;
use crate::error::ConfigError;

/// Maximum command timeout; anything longer stalls the polling loop badly
/// enough to trip the failure counter on the very next hiccup.
pub const MAX_COMMAND_TIMEOUT_MS: u64 = 5000;

/// OBD connection tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObdConfig {
    /// How long to wait for the socket connect to complete (ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-command response deadline (ms)
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Response deadline for fast-cycle polls (ms)
    #[serde(default = "default_fast_command_timeout_ms")]
    pub fast_command_timeout_ms: u64,
    /// Run a full query every N polling cycles; the rest poll the active PID
    #[serde(default = "default_full_query_every")]
    pub full_query_every: u32,
    /// Consecutive empty cycles before the connection is declared lost
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Baseline pressure subtracted from MAP for the boost gauge (kPa)
    #[serde(default = "default_atmospheric_kpa")]
    pub atmospheric_kpa: f64,
}

const fn default_connect_timeout_ms() -> u64 {
    10_000
}

const fn default_command_timeout_ms() -> u64 {
    500
}

const fn default_fast_command_timeout_ms() -> u64 {
    300
}

const fn default_full_query_every() -> u32 {
    100
}

const fn default_max_consecutive_failures() -> u32 {
    5
}

const fn default_atmospheric_kpa() -> f64 {
    ATMOSPHERIC_KPA
}

impl Default for ObdConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            fast_command_timeout_ms: default_fast_command_timeout_ms(),
            full_query_every: default_full_query_every(),
            max_consecutive_failures: default_max_consecutive_failures(),
            atmospheric_kpa: default_atmospheric_kpa(),
        }
    }
}

impl ObdConfig {
    /// Clamp values to valid ranges and fix invalid values
    pub fn validate(&mut self) {
        if self.connect_timeout_ms == 0 {
            warn!("connect_timeout_ms is 0, resetting to default");
            self.connect_timeout_ms = default_connect_timeout_ms();
        }
        if self.command_timeout_ms == 0 {
            warn!("command_timeout_ms is 0, resetting to default");
            self.command_timeout_ms = default_command_timeout_ms();
        }
        if self.command_timeout_ms > MAX_COMMAND_TIMEOUT_MS {
            warn!(
                "Clamping command_timeout_ms from {} to {}",
                self.command_timeout_ms, MAX_COMMAND_TIMEOUT_MS
            );
            self.command_timeout_ms = MAX_COMMAND_TIMEOUT_MS;
        }
        if self.fast_command_timeout_ms == 0 {
            warn!("fast_command_timeout_ms is 0, resetting to default");
            self.fast_command_timeout_ms = default_fast_command_timeout_ms();
        }
        if self.fast_command_timeout_ms > self.command_timeout_ms {
            warn!(
                "Clamping fast_command_timeout_ms from {} to {}",
                self.fast_command_timeout_ms, self.command_timeout_ms
            );
            self.fast_command_timeout_ms = self.command_timeout_ms;
        }
        if self.full_query_every == 0 {
            warn!("full_query_every is 0, resetting to 1");
            self.full_query_every = 1;
        }
        if self.max_consecutive_failures == 0 {
            warn!("max_consecutive_failures is 0, resetting to 1");
            self.max_consecutive_failures = 1;
        }
        if !self.atmospheric_kpa.is_finite() || self.atmospheric_kpa <= 0.0 {
            warn!(
                "atmospheric_kpa {} is not usable, resetting to default",
                self.atmospheric_kpa
            );
            self.atmospheric_kpa = default_atmospheric_kpa();
        }
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    #[must_use]
    pub const fn fast_command_timeout(&self) -> Duration {
        Duration::from_millis(self.fast_command_timeout_ms)
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(mut config) => {
                info!("Loaded config from {}", path.display());
                config.validate();
                config
            }
            Err(e) => {
                warn!("Failed to load config from {}: {e}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading config from {}", path.display());
        let buf = fs::read(path)?;
        let config: Self = serde_json::from_slice(&buf)?;
        debug!(
            "Config parsed: command_timeout_ms={}, full_query_every={}",
            config.command_timeout_ms, config.full_query_every
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        debug!("Saving config to {}", path.display());
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        info!("Config saved to {}", path.display());
        Ok(())
    }
}
