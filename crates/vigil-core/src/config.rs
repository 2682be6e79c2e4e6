//! Vigil configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::limiter::LockoutPolicy;
use crate::{
    DEFAULT_CHECK_INTERVAL_SECS, DEFAULT_DEBOUNCE_MS, DEFAULT_INACTIVITY_THRESHOLD_SECS,
    DEFAULT_MAX_CODE_ATTEMPTS,
};

/// Session security configuration.
///
/// There is no `Default`: `lockout_window_secs` is deployment policy and
/// must be set explicitly, either in the file or via [`VigilConfig::with_lockout_window`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VigilConfig {
    /// Idle time after which the session locks (seconds)
    #[serde(default = "default_inactivity_threshold_secs")]
    pub inactivity_threshold_secs: u64,

    /// Period of the inactivity check (seconds)
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Window collapsing bursts of activity into one write (milliseconds)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Consecutive invalid codes before input is disabled
    #[serde(default = "default_max_code_attempts")]
    pub max_code_attempts: u32,

    /// How long code input stays disabled after too many invalid codes (seconds)
    pub lockout_window_secs: u64,

    /// Where the persisted security state lives
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Substrings of a transaction rejection that blame the attached code
    #[serde(default = "default_code_error_patterns")]
    pub code_error_patterns: Vec<String>,
}

fn default_inactivity_threshold_secs() -> u64 {
    DEFAULT_INACTIVITY_THRESHOLD_SECS
}

fn default_check_interval_secs() -> u64 {
    DEFAULT_CHECK_INTERVAL_SECS
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_max_code_attempts() -> u32 {
    DEFAULT_MAX_CODE_ATTEMPTS
}

fn default_state_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vigil")
        .join("security_state.json")
}

fn default_code_error_patterns() -> Vec<String> {
    [
        "invalid code",
        "incorrect code",
        "invalid pin",
        "incorrect pin",
        "wrong pin",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

impl VigilConfig {
    /// Observed defaults plus an explicit lockout window
    pub fn with_lockout_window(window: Duration) -> Self {
        Self {
            inactivity_threshold_secs: default_inactivity_threshold_secs(),
            check_interval_secs: default_check_interval_secs(),
            debounce_ms: default_debounce_ms(),
            max_code_attempts: default_max_code_attempts(),
            lockout_window_secs: window.as_secs(),
            state_path: default_state_path(),
            code_error_patterns: default_code_error_patterns(),
        }
    }

    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.inactivity_threshold_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn lockout_policy(&self) -> LockoutPolicy {
        LockoutPolicy::new(
            self.max_code_attempts,
            Duration::from_secs(self.lockout_window_secs),
        )
    }

    /// Reject values that would disable locking or rate limiting
    pub fn validate(&self) -> Result<()> {
        if self.inactivity_threshold_secs == 0 {
            return Err(Error::Config(
                "inactivity_threshold_secs must be greater than zero".to_string(),
            ));
        }
        if self.check_interval_secs == 0 {
            return Err(Error::Config(
                "check_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_code_attempts == 0 {
            return Err(Error::Config(
                "max_code_attempts must be greater than zero".to_string(),
            ));
        }
        if self.lockout_window_secs == 0 {
            return Err(Error::Config(
                "lockout_window_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load and validate configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
