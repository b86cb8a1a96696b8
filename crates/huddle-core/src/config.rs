use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

const CONFIG_FILE: &str = "huddle.json";

/// Per-join parameters supplied by the application.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct SessionConfig {
    /// Meeting to join; opaque to the controller and passed to the transport.
    pub meeting: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub audio_input_id: Option<String>,
    #[serde(default)]
    pub audio_output_id: Option<String>,
    #[serde(default)]
    pub video_input_id: Option<String>,
    #[serde(default)]
    pub video_enabled: bool,
}

impl SessionConfig {
    pub fn new(meeting: impl Into<String>) -> Self {
        Self {
            meeting: meeting.into(),
            ..Default::default()
        }
    }
}

/// Exponential backoff parameters.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 15_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Degradation thresholds for the connection health monitor.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// Number of samples kept in the rolling window.
    pub window_size: usize,
    /// Packet loss fraction (0..1) above which a sample is poor.
    pub max_packet_loss: f32,
    /// Signal strength (0..1) below which a sample is poor.
    pub min_signal_strength: f32,
    /// Bitrate floor; `None` disables the check.
    pub min_bitrate_kbps: Option<u32>,
    /// Consecutive poor samples before the connection counts as degraded.
    pub degraded_after: usize,
    /// Consecutive poor samples before degradation is unrecoverable.
    pub unrecoverable_after: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            max_packet_loss: 0.05,
            min_signal_strength: 0.5,
            min_bitrate_kbps: None,
            degraded_after: 5,
            unrecoverable_after: 30,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.degraded_after == 0 {
            return Err(ConfigError::Invalid("health.degraded_after must be at least 1".into()));
        }
        if self.window_size < self.degraded_after {
            return Err(ConfigError::Invalid(
                "health.window_size must hold at least degraded_after samples".into(),
            ));
        }
        if self.unrecoverable_after <= self.degraded_after {
            return Err(ConfigError::Invalid(
                "health.unrecoverable_after must exceed degraded_after".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.max_packet_loss) {
            return Err(ConfigError::Invalid("health.max_packet_loss must be within 0..1".into()));
        }
        if !(0.0..=1.0).contains(&self.min_signal_strength) {
            return Err(ConfigError::Invalid(
                "health.min_signal_strength must be within 0..1".into(),
            ));
        }
        Ok(())
    }
}

/// Controller-wide policy, loaded once at construction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub max_join_attempts: u32,
    pub join_backoff: BackoffConfig,
    pub reconnect_backoff: BackoffConfig,
    pub health: HealthConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_join_attempts: 3,
            join_backoff: BackoffConfig {
                max_attempts: 3,
                initial_delay_ms: 250,
                max_delay_ms: 2_000,
                ..BackoffConfig::default()
            },
            reconnect_backoff: BackoffConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_join_attempts == 0 {
            return Err(ConfigError::Invalid("max_join_attempts must be at least 1".into()));
        }
        for (name, backoff) in [("join_backoff", &self.join_backoff), ("reconnect_backoff", &self.reconnect_backoff)] {
            if backoff.multiplier < 1.0 {
                return Err(ConfigError::Invalid(format!("{name}.multiplier must be >= 1.0")));
            }
            if backoff.max_delay_ms < backoff.initial_delay_ms {
                return Err(ConfigError::Invalid(format!(
                    "{name}.max_delay_ms must be >= initial_delay_ms"
                )));
            }
        }
        if self.reconnect_backoff.max_attempts == 0 {
            return Err(ConfigError::Invalid("reconnect_backoff.max_attempts must be at least 1".into()));
        }
        self.health.validate()
    }
}

/// Persists [`ControllerConfig`] as JSON in a data directory.
pub struct ConfigStore {
    config: Mutex<ControllerConfig>,
    file_path: PathBuf,
}

impl ConfigStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join(CONFIG_FILE);
        let config = Self::load(&file_path);
        Self {
            config: Mutex::new(config),
            file_path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn get(&self) -> ControllerConfig {
        self.lock().clone()
    }

    /// Apply a change, validate it and persist it.
    ///
    /// An invalid change is rejected and leaves the stored config untouched.
    pub fn update(&self, f: impl FnOnce(&mut ControllerConfig)) -> Result<(), ConfigError> {
        let mut candidate = self.get();
        f(&mut candidate);
        candidate.validate()?;
        self.save(&candidate)?;
        *self.lock() = candidate;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControllerConfig> {
        match self.config.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn save(&self, config: &ControllerConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.file_path, json)?;
        Ok(())
    }

    fn load(path: &Path) -> ControllerConfig {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(_) => return ControllerConfig::default(),
        };
        let config: ControllerConfig = match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("ignoring unreadable config {}: {e}", path.display());
                return ControllerConfig::default();
            }
        };
        match config.validate() {
            Ok(()) => config,
            Err(e) => {
                tracing::warn!("ignoring config {}: {e}", path.display());
                ControllerConfig::default()
            }
        }
    }
}
