//! Hotfire sequence engine.
//!
//! A timeline is a set of keyframes at T-relative times (T = 0 is ignition;
//! the sequence itself starts `time_before_ignition` seconds earlier), each
//! a per-board desired-state snapshot. Between two keyframes a servo marked
//! `ramp_to_next` interpolates its angle linearly toward the next keyframe.
//! Outside the keyframe span — before the first and after the last — the
//! safing snapshot (`start_end_desiredstate`) applies; the same snapshot is
//! what an engine abort pushes.
//!
//! Every snapshot handed out is a deep copy; callers can mutate it freely
//! without touching the stored timeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stand_types::StateUpdate;
use thiserror::Error;
use tracing::{error, info};

pub const SEQUENCE_FILE: &str = "hotfiresequence.json";

/// On-disk form of `configs/hotfiresequence.json`. Keyframe keys under
/// `sequence` are decimal strings; ordering is numeric, not lexicographic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceFile {
    pub time_before_ignition: f64,
    pub hotfire_safing_time: f64,
    pub start_end_desiredstate: BTreeMap<String, StateUpdate>,
    pub sequence: BTreeMap<String, BTreeMap<String, StateUpdate>>,
}

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
    #[error("keyframe time {0:?} is not a number")]
    BadTime(String),
    #[error("sequence has no keyframes")]
    Empty,
}

#[derive(Debug, Clone)]
struct Keyframe {
    t: f64,
    boards: BTreeMap<String, StateUpdate>,
}

pub struct HotfireController {
    path: PathBuf,
    raw: SequenceFile,
    /// Keyframes sorted by time.
    keyframes: Vec<Keyframe>,
    /// Last keyframe time plus the safing window.
    end_time: f64,
}

impl HotfireController {
    pub fn load(config_dir: &Path) -> Result<Self, SequenceError> {
        let path = config_dir.join(SEQUENCE_FILE);
        let text = std::fs::read_to_string(&path)?;
        let raw: SequenceFile = serde_json::from_str(&text)?;
        let (keyframes, end_time) = compile(&raw)?;
        info!(
            "hotfire sequence loaded: {} keyframe(s), T-{}s countdown, {}s safing",
            keyframes.len(),
            raw.time_before_ignition,
            raw.hotfire_safing_time
        );
        Ok(Self {
            path,
            raw,
            keyframes,
            end_time,
        })
    }

    /// Validates and installs a replacement timeline, then rewrites the
    /// canonical file. The previous timeline stays installed on error.
    pub fn replace(&mut self, value: &Value) -> Result<(), SequenceError> {
        let raw: SequenceFile = serde_json::from_value(value.clone())?;
        let (keyframes, end_time) = compile(&raw)?;
        std::fs::write(&self.path, serde_json::to_string_pretty(&raw)?)?;
        self.raw = raw;
        self.keyframes = keyframes;
        self.end_time = end_time;
        info!("hotfire sequence replaced: {} keyframe(s)", self.keyframes.len());
        Ok(())
    }

    pub fn sequence_value(&self) -> Value {
        serde_json::to_value(&self.raw).unwrap_or(Value::Null)
    }

    /// T-time: negative during the countdown, zero at ignition.
    pub fn get_t(&self, time_since_statechange: f64) -> f64 {
        time_since_statechange - self.raw.time_before_ignition
    }

    /// True once T has passed the last keyframe by more than the safing
    /// window.
    pub fn is_complete(&self, time_since_statechange: f64) -> bool {
        self.get_t(time_since_statechange) > self.end_time
    }

    /// The safing snapshot pushed on engine abort (and applied outside the
    /// keyframe span).
    pub fn abort_desiredstate(&self) -> BTreeMap<String, StateUpdate> {
        self.raw.start_end_desiredstate.clone()
    }

    /// The per-board desired state for this instant: the governing keyframe
    /// with ramp interpolation applied. Always a deep copy.
    pub fn desiredstate(&self, time_since_statechange: f64) -> BTreeMap<String, StateUpdate> {
        let t = self.get_t(time_since_statechange);
        let (Some(first), Some(last)) = (self.keyframes.first(), self.keyframes.last()) else {
            return self.abort_desiredstate();
        };
        if t < first.t || t > last.t {
            return self.abort_desiredstate();
        }

        // Largest index whose keyframe time is <= T; equality selects the
        // keyframe itself.
        let idx = self.keyframes.partition_point(|frame| frame.t <= t) - 1;
        let base_t = self.keyframes[idx].t;
        let next = self.keyframes.get(idx + 1);
        let mut snapshot = self.keyframes[idx].boards.clone();

        for (board_name, board_update) in snapshot.iter_mut() {
            for (servo_name, servo) in board_update.servos.iter_mut() {
                if !servo.ramp_to_next.unwrap_or(false) {
                    continue;
                }
                let next_angle = next
                    .and_then(|frame| frame.boards.get(board_name))
                    .and_then(|board| board.servos.get(servo_name))
                    .and_then(|servo| servo.angle);
                match (servo.angle, next, next_angle) {
                    (Some(a), Some(frame), Some(b)) => {
                        let (t0, t1) = (base_t, frame.t);
                        servo.angle = Some((a * (t1 - t) + b * (t - t0)) / (t1 - t0));
                        servo.ramp_to_next = None;
                    }
                    _ => error!(
                        "hotfire sequence cannot ramp servo {servo_name} on board \
                         {board_name}: no next keyframe angle; holding base angle"
                    ),
                }
            }
        }
        snapshot
    }
}

fn compile(raw: &SequenceFile) -> Result<(Vec<Keyframe>, f64), SequenceError> {
    let mut keyframes = Vec::with_capacity(raw.sequence.len());
    for (time_str, boards) in &raw.sequence {
        let t: f64 = time_str
            .trim()
            .parse()
            .map_err(|_| SequenceError::BadTime(time_str.clone()))?;
        keyframes.push(Keyframe {
            t,
            boards: boards.clone(),
        });
    }
    keyframes.sort_by(|a, b| a.t.total_cmp(&b.t));
    let Some(last) = keyframes.last() else {
        return Err(SequenceError::Empty);
    };
    let end_time = last.t + raw.hotfire_safing_time;
    Ok((keyframes, end_time))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Countdown of 2 s, one servo ramping 0→90 over two seconds of fire
    /// time, one second of safing.
    pub(crate) fn ramp_sequence() -> Value {
        json!({
            "time_before_ignition": 2.0,
            "hotfire_safing_time": 1.0,
            "start_end_desiredstate": {
                "B": {"servos": {"s": {"armed": true, "angle": 0.0, "powered": false}}}
            },
            "sequence": {
                "0.0": {"B": {"servos": {"s": {"angle": 0.0, "ramp_to_next": true}}}},
                "2.0": {"B": {"servos": {"s": {"angle": 90.0}}}}
            }
        })
    }

    pub(crate) fn controller_from(value: Value) -> (tempfile::TempDir, HotfireController) {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(SEQUENCE_FILE),
            serde_json::to_string_pretty(&value).expect("serialize"),
        )
        .expect("write");
        let controller = HotfireController::load(dir.path()).expect("load");
        (dir, controller)
    }

    #[test]
    fn t_time_is_zero_at_ignition() {
        let (_dir, hotfire) = controller_from(ramp_sequence());
        assert_eq!(hotfire.get_t(2.0), 0.0);
        assert_eq!(hotfire.get_t(0.5), -1.5);
    }

    #[test]
    fn ramp_midpoint_interpolates_and_strips_the_flag() {
        let (_dir, hotfire) = controller_from(ramp_sequence());
        // t_since_statechange = 3.0 → T = 1.0, halfway through the ramp.
        let snapshot = hotfire.desiredstate(3.0);
        let servo = &snapshot["B"].servos["s"];
        assert_eq!(servo.angle, Some(45.0));
        assert!(servo.ramp_to_next.is_none());
    }

    #[test]
    fn exact_keyframe_time_selects_that_keyframe() {
        let (_dir, hotfire) = controller_from(ramp_sequence());
        // T = 2.0 exactly: keyframe index 1, not the ramping frame before it.
        let snapshot = hotfire.desiredstate(4.0);
        assert_eq!(snapshot["B"].servos["s"].angle, Some(90.0));
        // T = 0.0 exactly: the first keyframe (ramp start).
        let snapshot = hotfire.desiredstate(2.0);
        assert_eq!(snapshot["B"].servos["s"].angle, Some(0.0));
    }

    #[test]
    fn outside_the_span_returns_the_safing_snapshot() {
        let (_dir, hotfire) = controller_from(ramp_sequence());
        // T = -0.5, before the first keyframe.
        let pre = hotfire.desiredstate(1.5);
        assert_eq!(pre["B"].servos["s"].powered, Some(false));
        // T = 2.5, after the last keyframe.
        let post = hotfire.desiredstate(4.5);
        assert_eq!(post, pre);
    }

    #[test]
    fn completion_boundary_is_strict() {
        let (_dir, hotfire) = controller_from(ramp_sequence());
        // end = last keyframe (2.0) + safing (1.0); T = t_since - 2.0.
        assert!(!hotfire.is_complete(5.0));
        assert!(hotfire.is_complete(5.000001));
    }

    #[test]
    fn last_keyframe_ramp_request_retains_base_angle() {
        let (_dir, hotfire) = controller_from(json!({
            "time_before_ignition": 0.0,
            "hotfire_safing_time": 1.0,
            "start_end_desiredstate": {},
            "sequence": {
                "0.0": {"B": {"servos": {"s": {"angle": 30.0, "ramp_to_next": true}}}}
            }
        }));
        let snapshot = hotfire.desiredstate(0.0);
        assert_eq!(snapshot["B"].servos["s"].angle, Some(30.0));
    }

    #[test]
    fn snapshots_are_disjoint_from_the_timeline() {
        let (_dir, hotfire) = controller_from(ramp_sequence());
        let mut snapshot = hotfire.desiredstate(2.0);
        if let Some(servo) = snapshot
            .get_mut("B")
            .and_then(|b| b.servos.get_mut("s"))
        {
            servo.angle = Some(999.0);
        }
        // A later call is untouched by the mutation.
        assert_eq!(hotfire.desiredstate(2.0)["B"].servos["s"].angle, Some(0.0));
    }

    #[test]
    fn keyframe_order_is_numeric_not_lexicographic() {
        let (_dir, hotfire) = controller_from(json!({
            "time_before_ignition": 0.0,
            "hotfire_safing_time": 0.0,
            "start_end_desiredstate": {},
            "sequence": {
                "10.0": {"B": {"servos": {"s": {"angle": 3.0}}}},
                "2.0":  {"B": {"servos": {"s": {"angle": 2.0}}}},
                "-1.0": {"B": {"servos": {"s": {"angle": 1.0}}}}
            }
        }));
        assert_eq!(hotfire.desiredstate(5.0)["B"].servos["s"].angle, Some(2.0));
        assert!(!hotfire.is_complete(10.0));
        assert!(hotfire.is_complete(10.1));
    }

    #[test]
    fn replace_round_trips_and_rejects_bad_timelines() {
        let (_dir, mut hotfire) = controller_from(ramp_sequence());
        // set(get()) is a no-op on keyframe ordering.
        let current = hotfire.sequence_value();
        hotfire.replace(&current).expect("round trip");
        assert_eq!(hotfire.desiredstate(3.0)["B"].servos["s"].angle, Some(45.0));

        // A timeline with an unparseable key is refused and nothing changes.
        let bad = json!({
            "time_before_ignition": 1.0,
            "hotfire_safing_time": 1.0,
            "start_end_desiredstate": {},
            "sequence": {"not-a-number": {}}
        });
        assert!(matches!(
            hotfire.replace(&bad),
            Err(SequenceError::BadTime(_))
        ));
        assert_eq!(hotfire.desiredstate(3.0)["B"].servos["s"].angle, Some(45.0));

        let empty = json!({
            "time_before_ignition": 1.0,
            "hotfire_safing_time": 1.0,
            "start_end_desiredstate": {},
            "sequence": {}
        });
        assert!(matches!(hotfire.replace(&empty), Err(SequenceError::Empty)));
    }
}
