//! Hardware configuration: `configs/hardware_config.json` plus the handful
//! of process settings that come from the environment.
//!
//! The file has two mandatory sections: `boards` (per-board transport,
//! polling cadence and hardware items) and `state_defaults` (the default
//! field values each hardware family starts from). A file missing either
//! section is refused outright — boards cannot be mirrored without both.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stand_types::HardwareType;
use thiserror::Error;

// ── Process settings (environment) ────────────────────────────────────────────

pub struct Settings {
    /// Operator command channel bind address.
    pub command_addr: String,
    /// Directory holding `hardware_config.json` and `hotfiresequence.json`.
    pub config_dir: PathBuf,
    /// Directory for CSV test logs.
    pub log_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            command_addr: std::env::var("STAND_CMD_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8888".to_string()),
            config_dir: std::env::var("STAND_CONFIG_DIR")
                .unwrap_or_else(|_| "configs".to_string())
                .into(),
            log_dir: std::env::var("STAND_LOG_DIR")
                .unwrap_or_else(|_| "logs".to_string())
                .into(),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
    #[error("hardware config has no boards section")]
    NoBoards,
    #[error("hardware config has no state_defaults section")]
    NoStateDefaults,
}

// ── Hardware config ───────────────────────────────────────────────────────────

/// Default field values per hardware family, as raw JSON objects. Board
/// state is built by overlaying each item's config onto its family defaults.
pub type StateDefaults = BTreeMap<HardwareType, serde_json::Map<String, Value>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    pub boards: BTreeMap<String, BoardConfig>,
    pub state_defaults: StateDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    pub baudrate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    pub ip: String,
    pub port: u16,
}

/// Read-only metadata for one board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<SerialConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpConfig>,
    #[serde(default)]
    pub is_actuator: bool,
    /// Base scheduler period in seconds.
    pub polling_interval: f64,
    /// Scheduler period while the machine idles (falls back to
    /// `polling_interval`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_interval: Option<f64>,
    /// Scheduler period during hotfire (falls back to `polling_interval`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_interval: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pts: BTreeMap<String, SensorItemConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tcs: BTreeMap<String, SensorItemConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub loadcells: BTreeMap<String, SensorItemConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub servos: BTreeMap<String, ServoItemConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub solenoids: BTreeMap<String, ActuatorItemConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pyros: BTreeMap<String, ActuatorItemConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub imus: BTreeMap<String, SensorItemConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub gnss: BTreeMap<String, SensorItemConfig>,
}

impl BoardConfig {
    pub fn idle_pace(&self) -> Duration {
        Duration::from_secs_f64(self.idle_interval.unwrap_or(self.polling_interval))
    }

    pub fn active_pace(&self) -> Duration {
        Duration::from_secs_f64(self.active_interval.unwrap_or(self.polling_interval))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorItemConfig {
    pub channel: u16,
    /// Per-channel calibration; copied into state on load.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gain: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
    /// Seed value for firmware echo tests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Marks channels whose gain/offset belong in the test-log header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adc: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServoItemConfig {
    pub channel: u16,
    /// When set, the servo starts armed at this angle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_angle: Option<f64>,
    /// Desired angle restored when the servo is disarmed (0 when absent).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disarm_angle: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorItemConfig {
    pub channel: u16,
}

// ── Load / save ───────────────────────────────────────────────────────────────

pub const HARDWARE_CONFIG_FILE: &str = "hardware_config.json";

pub fn load_hardware_config(path: &Path) -> Result<HardwareConfig, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let raw: Value = serde_json::from_str(&text)?;
    validate_sections(&raw)?;
    Ok(serde_json::from_value(raw)?)
}

/// Validates a replacement config and writes it back as the canonical file.
pub fn save_hardware_config(path: &Path, raw: &Value) -> Result<(), ConfigError> {
    validate_sections(raw)?;
    let config: HardwareConfig = serde_json::from_value(raw.clone())?;
    std::fs::write(path, serde_json::to_string_pretty(&config)?)?;
    Ok(())
}

fn validate_sections(raw: &Value) -> Result<(), ConfigError> {
    let boards_populated = raw
        .get("boards")
        .and_then(Value::as_object)
        .is_some_and(|boards| !boards.is_empty());
    if !boards_populated {
        return Err(ConfigError::NoBoards);
    }
    let defaults_populated = raw
        .get("state_defaults")
        .and_then(Value::as_object)
        .is_some_and(|defaults| !defaults.is_empty());
    if !defaults_populated {
        return Err(ConfigError::NoStateDefaults);
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
