//! # stand-types
//!
//! Shared hardware state model for the ground control suite.
//!
//! These types are used by:
//! - `backend`: the authoritative board mirrors (actual + desired state)
//! - `board-simulator`: producing well-formed response frames in tests/demos
//!
//! ## Shape conventions
//!
//! Board telemetry and commands travel as nested JSON,
//! `hw_type → item_name → field → value`. Inside the process that shape is
//! typed: one fixed-schema struct per hardware family (dense, every field
//! present) plus a sparse `*Update` mirror (every field optional) that
//! deserializes straight off the wire. Frames may carry extra top-level keys
//! (`send_id`, `timestamp`); serde ignores them.
//!
//! Dense state is owned all the way down — `Clone` is a deep copy, and two
//! mirrors can never share substructure.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Hardware families ─────────────────────────────────────────────────────────

/// Device-family tag. The wire/config key is the lowercase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareType {
    Pts,
    Tcs,
    Loadcells,
    Servos,
    Solenoids,
    Pyros,
    Imus,
    Gnss,
}

impl HardwareType {
    pub const ALL: [HardwareType; 8] = [
        HardwareType::Pts,
        HardwareType::Tcs,
        HardwareType::Loadcells,
        HardwareType::Servos,
        HardwareType::Solenoids,
        HardwareType::Pyros,
        HardwareType::Imus,
        HardwareType::Gnss,
    ];

    pub fn key(self) -> &'static str {
        match self {
            HardwareType::Pts => "pts",
            HardwareType::Tcs => "tcs",
            HardwareType::Loadcells => "loadcells",
            HardwareType::Servos => "servos",
            HardwareType::Solenoids => "solenoids",
            HardwareType::Pyros => "pyros",
            HardwareType::Imus => "imus",
            HardwareType::Gnss => "gnss",
        }
    }

    /// Families that carry the two-step arming gate.
    pub fn is_armable(self) -> bool {
        matches!(
            self,
            HardwareType::Servos | HardwareType::Solenoids | HardwareType::Pyros
        )
    }

    /// Families whose state carries a live measurement `value`.
    pub fn has_value(self) -> bool {
        matches!(
            self,
            HardwareType::Pts | HardwareType::Tcs | HardwareType::Loadcells
        )
    }
}

impl std::fmt::Display for HardwareType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

// ── Dense per-item states ─────────────────────────────────────────────────────

/// Pressure transducer channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtState {
    pub channel: u16,
    pub value: f64,
    pub gain: f64,
    pub offset: f64,
}

/// Thermocouple channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcState {
    pub channel: u16,
    pub value: f64,
}

/// Load cell channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadcellState {
    pub channel: u16,
    pub value: f64,
    pub gain: f64,
    pub offset: f64,
}

/// Servo channel. `armed` gates every other desired-state field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoState {
    pub channel: u16,
    pub armed: bool,
    pub angle: f64,
    pub powered: bool,
}

/// Solenoid valve channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolenoidState {
    pub channel: u16,
    pub armed: bool,
    pub powered: bool,
}

/// Pyrotechnic channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PyroState {
    pub channel: u16,
    pub armed: bool,
    pub powered: bool,
}

/// Inertial measurement unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuState {
    pub channel: u16,
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
}

/// GNSS receiver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GnssState {
    pub channel: u16,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

// ── Sparse per-item updates ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PtUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gain: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadcellUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gain: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
}

/// Sparse servo command. `ramp_to_next` only appears inside hotfire timeline
/// keyframes; it is stripped before the snapshot reaches a board.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServoUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub armed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub angle: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub powered: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ramp_to_next: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolenoidUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub armed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub powered: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PyroUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub armed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub powered: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ax: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ay: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub az: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gz: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GnssUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
}

// ── Field-by-field overwrite ──────────────────────────────────────────────────

macro_rules! apply_fields {
    ($state:expr, $update:expr, [$($field:ident),+ $(,)?]) => {
        $(
            if let Some(v) = $update.$field {
                $state.$field = v;
            }
        )+
    };
}

impl PtState {
    pub fn apply(&mut self, u: &PtUpdate) {
        apply_fields!(self, u, [channel, value, gain, offset]);
    }
}

impl TcState {
    pub fn apply(&mut self, u: &TcUpdate) {
        apply_fields!(self, u, [channel, value]);
    }
}

impl LoadcellState {
    pub fn apply(&mut self, u: &LoadcellUpdate) {
        apply_fields!(self, u, [channel, value, gain, offset]);
    }
}

impl ServoState {
    /// Overwrites every sparse field except `ramp_to_next`, which has no
    /// dense counterpart and dies here.
    pub fn apply(&mut self, u: &ServoUpdate) {
        apply_fields!(self, u, [channel, armed, angle, powered]);
    }
}

impl SolenoidState {
    pub fn apply(&mut self, u: &SolenoidUpdate) {
        apply_fields!(self, u, [channel, armed, powered]);
    }
}

impl PyroState {
    pub fn apply(&mut self, u: &PyroUpdate) {
        apply_fields!(self, u, [channel, armed, powered]);
    }
}

impl ImuState {
    pub fn apply(&mut self, u: &ImuUpdate) {
        apply_fields!(self, u, [channel, ax, ay, az, gx, gy, gz]);
    }
}

impl GnssState {
    pub fn apply(&mut self, u: &GnssUpdate) {
        apply_fields!(self, u, [channel, lat, lon, alt]);
    }
}

// ── Whole-board containers ────────────────────────────────────────────────────

/// Dense mirror of one board: every configured item with every schema field.
/// Used for both actual state and desired state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardState {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub pts: BTreeMap<String, PtState>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tcs: BTreeMap<String, TcState>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub loadcells: BTreeMap<String, LoadcellState>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub servos: BTreeMap<String, ServoState>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub solenoids: BTreeMap<String, SolenoidState>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub pyros: BTreeMap<String, PyroState>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub imus: BTreeMap<String, ImuState>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub gnss: BTreeMap<String, GnssState>,
}

/// Sparse update for one board, straight off a wire frame, a timeline
/// keyframe, or an operator request. Extra top-level frame keys are ignored
/// during deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateUpdate {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub pts: BTreeMap<String, PtUpdate>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tcs: BTreeMap<String, TcUpdate>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub loadcells: BTreeMap<String, LoadcellUpdate>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub servos: BTreeMap<String, ServoUpdate>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub solenoids: BTreeMap<String, SolenoidUpdate>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub pyros: BTreeMap<String, PyroUpdate>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub imus: BTreeMap<String, ImuUpdate>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub gnss: BTreeMap<String, GnssUpdate>,
}

impl StateUpdate {
    pub fn is_empty(&self) -> bool {
        self.pts.is_empty()
            && self.tcs.is_empty()
            && self.loadcells.is_empty()
            && self.servos.is_empty()
            && self.solenoids.is_empty()
            && self.pyros.is_empty()
            && self.imus.is_empty()
            && self.gnss.is_empty()
    }
}

impl BoardState {
    /// Telemetry merge: overwrite matching fields of known items, ignore
    /// unknown items (forward compatibility with firmware that reports more
    /// than the config declares).
    pub fn apply_update(&mut self, update: &StateUpdate) {
        for (name, u) in &update.pts {
            if let Some(item) = self.pts.get_mut(name) {
                item.apply(u);
            }
        }
        for (name, u) in &update.tcs {
            if let Some(item) = self.tcs.get_mut(name) {
                item.apply(u);
            }
        }
        for (name, u) in &update.loadcells {
            if let Some(item) = self.loadcells.get_mut(name) {
                item.apply(u);
            }
        }
        for (name, u) in &update.servos {
            if let Some(item) = self.servos.get_mut(name) {
                item.apply(u);
            }
        }
        for (name, u) in &update.solenoids {
            if let Some(item) = self.solenoids.get_mut(name) {
                item.apply(u);
            }
        }
        for (name, u) in &update.pyros {
            if let Some(item) = self.pyros.get_mut(name) {
                item.apply(u);
            }
        }
        for (name, u) in &update.imus {
            if let Some(item) = self.imus.get_mut(name) {
                item.apply(u);
            }
        }
        for (name, u) in &update.gnss {
            if let Some(item) = self.gnss.get_mut(name) {
                item.apply(u);
            }
        }
    }

    /// Builds the sensor-query payload for a polling cycle: `{channel}` per
    /// configured item, plus the last `value` for families that measure one
    /// (firmware echo tests compare against it).
    pub fn poll_query(&self) -> StateUpdate {
        let mut query = StateUpdate::default();
        for (name, item) in &self.pts {
            query.pts.insert(
                name.clone(),
                PtUpdate {
                    channel: Some(item.channel),
                    value: Some(item.value),
                    ..Default::default()
                },
            );
        }
        for (name, item) in &self.tcs {
            query.tcs.insert(
                name.clone(),
                TcUpdate {
                    channel: Some(item.channel),
                    value: Some(item.value),
                },
            );
        }
        for (name, item) in &self.loadcells {
            query.loadcells.insert(
                name.clone(),
                LoadcellUpdate {
                    channel: Some(item.channel),
                    value: Some(item.value),
                    ..Default::default()
                },
            );
        }
        for (name, item) in &self.servos {
            query.servos.insert(
                name.clone(),
                ServoUpdate {
                    channel: Some(item.channel),
                    ..Default::default()
                },
            );
        }
        for (name, item) in &self.solenoids {
            query.solenoids.insert(
                name.clone(),
                SolenoidUpdate {
                    channel: Some(item.channel),
                    ..Default::default()
                },
            );
        }
        for (name, item) in &self.pyros {
            query.pyros.insert(
                name.clone(),
                PyroUpdate {
                    channel: Some(item.channel),
                    ..Default::default()
                },
            );
        }
        for (name, item) in &self.imus {
            query.imus.insert(
                name.clone(),
                ImuUpdate {
                    channel: Some(item.channel),
                    ..Default::default()
                },
            );
        }
        for (name, item) in &self.gnss {
            query.gnss.insert(
                name.clone(),
                GnssUpdate {
                    channel: Some(item.channel),
                    ..Default::default()
                },
            );
        }
        query
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn board_with_servo() -> BoardState {
        let mut state = BoardState::default();
        state.servos.insert(
            "main".into(),
            ServoState {
                channel: 3,
                armed: false,
                angle: 10.0,
                powered: false,
            },
        );
        state
    }

    #[test]
    fn sparse_apply_overwrites_only_present_fields() {
        let mut state = board_with_servo();
        let update: StateUpdate =
            serde_json::from_str(r#"{"servos": {"main": {"angle": 42.5}}}"#).unwrap();
        state.apply_update(&update);

        let servo = &state.servos["main"];
        assert_eq!(servo.angle, 42.5);
        assert_eq!(servo.channel, 3);
        assert!(!servo.armed);
    }

    #[test]
    fn unknown_items_and_families_are_ignored() {
        let mut state = board_with_servo();
        let before = state.clone();
        let update: StateUpdate = serde_json::from_str(
            r#"{"servos": {"ghost": {"angle": 99.0}}, "pts": {"p0": {"value": 5.0}}}"#,
        )
        .unwrap();
        state.apply_update(&update);
        assert_eq!(state, before);
    }

    #[test]
    fn frame_extras_are_tolerated() {
        let update: StateUpdate = serde_json::from_str(
            r#"{"send_id": 7, "timestamp": 0, "tcs": {"t1": {"value": 301.2}}}"#,
        )
        .unwrap();
        assert_eq!(update.tcs["t1"].value, Some(301.2));
    }

    #[test]
    fn ramp_flag_never_reaches_dense_state() {
        let mut servo = ServoState::default();
        let u: ServoUpdate =
            serde_json::from_str(r#"{"angle": 15.0, "ramp_to_next": true}"#).unwrap();
        servo.apply(&u);
        assert_eq!(servo.angle, 15.0);
        let round_trip = serde_json::to_value(&servo).unwrap();
        assert!(round_trip.get("ramp_to_next").is_none());
    }

    #[test]
    fn clone_is_a_deep_copy() {
        let state = board_with_servo();
        let mut copy = state.clone();
        copy.servos.get_mut("main").unwrap().angle = 180.0;
        assert_eq!(state.servos["main"].angle, 10.0);
    }

    #[test]
    fn poll_query_lists_channel_and_value() {
        let mut state = BoardState::default();
        state.pts.insert(
            "chamber".into(),
            PtState {
                channel: 1,
                value: 13.7,
                gain: 2.0,
                offset: -0.5,
            },
        );
        let query = state.poll_query();
        let pt = &query.pts["chamber"];
        assert_eq!(pt.channel, Some(1));
        assert_eq!(pt.value, Some(13.7));
        assert!(pt.gain.is_none());
    }
}
