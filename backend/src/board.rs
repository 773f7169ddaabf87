//! One board: the mirrored actual/desired state of a single microcontroller
//! plus its transport and polling scheduler.
//!
//! `state` only ever mutates from correlated transport responses.
//! `desired_state` mutates from the hotfire controller, the command router,
//! or a disarm-all sweep, and every merge passes the arming firewall:
//!
//! - an item whose *actual* `armed` is false accepts no field writes and has
//!   its desired `powered` forced off
//! - the incoming `armed` flag itself always mirrors through, so arming is a
//!   deliberate separate step
//! - disarming a servo snaps its desired angle back to the configured
//!   `disarm_angle` (0 when the config has none)
//!
//! Both mirrors live behind a single per-board lock; they are separate owned
//! values and can never share substructure.

use std::sync::Arc;

use serde_json::Value;
use stand_types::{BoardState, ServoState, StateUpdate};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::{BoardConfig, ConfigError, StateDefaults};
use crate::scheduler;
use crate::time_keeper::TimeKeeper;
use crate::transport::{BoardLink, SerialLink, UdpLink};

struct BoardMirror {
    state: BoardState,
    desired: BoardState,
}

pub struct Board {
    pub name: String,
    pub config: BoardConfig,
    mirror: RwLock<BoardMirror>,
    link: Option<BoardLink>,
    poll_keeper: Arc<TimeKeeper>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl Board {
    /// Builds the board's mirrors from config + state defaults, opens its
    /// transport and starts its command scheduler. A transport that fails to
    /// open leaves the board dark (no scheduler) but never takes the rest of
    /// the stand down.
    pub async fn initialise(
        name: &str,
        config: BoardConfig,
        defaults: &StateDefaults,
    ) -> Result<Arc<Board>, ConfigError> {
        let state = build_state(&config, defaults)?;
        let desired = build_desired(&config, &state);

        let link = open_link(name, &config).await;
        let poll_keeper = Arc::new(TimeKeeper::new(
            format!("{name}-scheduler"),
            std::time::Duration::from_secs_f64(config.polling_interval),
            None,
        ));

        let board = Arc::new(Board {
            name: name.to_string(),
            config,
            mirror: RwLock::new(BoardMirror { state, desired }),
            link,
            poll_keeper,
            scheduler: Mutex::new(None),
        });

        if board.link.is_some() {
            let handle = scheduler::spawn(board.clone());
            *board.scheduler.lock().await = Some(handle);
        }
        Ok(board)
    }

    pub fn is_actuator(&self) -> bool {
        self.config.is_actuator
    }

    pub fn link(&self) -> Option<&BoardLink> {
        self.link.as_ref()
    }

    pub fn poll_keeper(&self) -> &Arc<TimeKeeper> {
        &self.poll_keeper
    }

    pub async fn state(&self) -> BoardState {
        self.mirror.read().await.state.clone()
    }

    pub async fn desired_state(&self) -> BoardState {
        self.mirror.read().await.desired.clone()
    }

    /// Telemetry merge: fields of known items overwrite, everything else is
    /// silently ignored.
    pub async fn update_state(&self, update: &StateUpdate) {
        self.mirror.write().await.state.apply_update(update);
    }

    /// Desired-state merge through the arming firewall.
    pub async fn update_desired_state(&self, update: &StateUpdate) {
        let mut mirror = self.mirror.write().await;
        let BoardMirror { state, desired } = &mut *mirror;

        for (name, incoming) in &update.servos {
            let Some(actual) = state.servos.get(name) else {
                continue;
            };
            let Some(target) = desired.servos.get_mut(name) else {
                continue;
            };
            if actual.armed {
                target.apply(incoming);
            } else {
                target.powered = false;
            }
            if let Some(armed) = incoming.armed {
                target.armed = armed;
                if !armed {
                    target.angle = self
                        .config
                        .servos
                        .get(name)
                        .and_then(|cfg| cfg.disarm_angle)
                        .unwrap_or(0.0);
                }
            }
        }

        for (name, incoming) in &update.solenoids {
            let Some(actual) = state.solenoids.get(name) else {
                continue;
            };
            let Some(target) = desired.solenoids.get_mut(name) else {
                continue;
            };
            if actual.armed {
                target.apply(incoming);
            } else {
                target.powered = false;
            }
            if let Some(armed) = incoming.armed {
                target.armed = armed;
            }
        }

        for (name, incoming) in &update.pyros {
            let Some(actual) = state.pyros.get(name) else {
                continue;
            };
            let Some(target) = desired.pyros.get_mut(name) else {
                continue;
            };
            if actual.armed {
                target.apply(incoming);
            } else {
                target.powered = false;
            }
            if let Some(armed) = incoming.armed {
                target.armed = armed;
            }
        }
    }

    /// Drops the armed flag on every servo, solenoid and pyro in the desired
    /// state. Pure local mutation; the next actuator write carries it out.
    pub async fn disarm_all(&self) {
        if !self.config.is_actuator {
            return;
        }
        let mut mirror = self.mirror.write().await;
        for servo in mirror.desired.servos.values_mut() {
            servo.armed = false;
        }
        for solenoid in mirror.desired.solenoids.values_mut() {
            solenoid.armed = false;
        }
        for pyro in mirror.desired.pyros.values_mut() {
            pyro.armed = false;
        }
    }

    /// The frame the scheduler sends this cycle: a sensor query for sensing
    /// boards, the current desired state for actuator boards.
    pub async fn poll_frame(&self) -> Value {
        let mirror = self.mirror.read().await;
        let payload = if self.config.is_actuator {
            let mut frame = match serde_json::to_value(&mirror.desired) {
                Ok(v) => v,
                Err(e) => {
                    error!("board {}: could not serialize desired state: {e}", self.name);
                    Value::Object(Default::default())
                }
            };
            if let Value::Object(map) = &mut frame {
                map.insert("timestamp".into(), 0.into());
            }
            frame
        } else {
            match serde_json::to_value(mirror.state.poll_query()) {
                Ok(v) => v,
                Err(e) => {
                    error!("board {}: could not serialize sensor query: {e}", self.name);
                    Value::Object(Default::default())
                }
            }
        };
        payload
    }

    /// One correlated exchange: send `payload`, fold the response into the
    /// actual state, hand the raw response back.
    pub async fn send_receive(&self, payload: Value) -> Option<Value> {
        let link = self.link.as_ref()?;
        let response = link.send_receive(payload).await?;
        match serde_json::from_value::<StateUpdate>(response.clone()) {
            Ok(update) => self.update_state(&update).await,
            Err(e) => warn!(
                "board {}: response frame did not parse as telemetry: {e}",
                self.name
            ),
        }
        Some(response)
    }

    /// Stops the scheduler and transport tasks. Safe to call twice.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.scheduler.lock().await.take() {
            handle.abort();
        }
        if let Some(link) = &self.link {
            link.shutdown();
        }
        debug!("board {} shut down", self.name);
    }
}

async fn open_link(name: &str, config: &BoardConfig) -> Option<BoardLink> {
    if let Some(serial_cfg) = &config.serial {
        match SerialLink::open(name, serial_cfg).await {
            Ok(link) => return Some(BoardLink::Serial(link)),
            Err(e) => {
                error!("failed to initialise serial for board {name}: {e}");
                return None;
            }
        }
    }
    if let Some(udp_cfg) = &config.udp {
        match UdpLink::open(name, udp_cfg).await {
            Ok(link) => return Some(BoardLink::Udp(link)),
            Err(e) => {
                error!("failed to initialise udp for board {name}: {e}");
                return None;
            }
        }
    }
    warn!("board {name} has no transport configured");
    None
}

// ── Mirror construction ───────────────────────────────────────────────────────

/// Overlay an item's config onto its family defaults and parse the result as
/// the dense item state. Config-only fields (`safe_angle`, `adc`, …) fall
/// away; schema fields missing from both sides take the struct default.
fn item_from_defaults<T, C>(
    defaults: Option<&serde_json::Map<String, Value>>,
    overlay: &C,
) -> Result<T, serde_json::Error>
where
    T: serde::de::DeserializeOwned,
    C: serde::Serialize,
{
    let mut obj = defaults.cloned().unwrap_or_default();
    if let Value::Object(extra) = serde_json::to_value(overlay)? {
        obj.extend(extra);
    }
    serde_json::from_value(Value::Object(obj))
}

fn build_state(config: &BoardConfig, defaults: &StateDefaults) -> Result<BoardState, ConfigError> {
    use stand_types::HardwareType as Hw;

    let mut state = BoardState::default();
    for (name, item) in &config.pts {
        state
            .pts
            .insert(name.clone(), item_from_defaults(defaults.get(&Hw::Pts), item)?);
    }
    for (name, item) in &config.tcs {
        state
            .tcs
            .insert(name.clone(), item_from_defaults(defaults.get(&Hw::Tcs), item)?);
    }
    for (name, item) in &config.loadcells {
        state.loadcells.insert(
            name.clone(),
            item_from_defaults(defaults.get(&Hw::Loadcells), item)?,
        );
    }
    for (name, item) in &config.servos {
        state.servos.insert(
            name.clone(),
            item_from_defaults(defaults.get(&Hw::Servos), item)?,
        );
    }
    for (name, item) in &config.solenoids {
        state.solenoids.insert(
            name.clone(),
            item_from_defaults(defaults.get(&Hw::Solenoids), item)?,
        );
    }
    for (name, item) in &config.pyros {
        state.pyros.insert(
            name.clone(),
            item_from_defaults(defaults.get(&Hw::Pyros), item)?,
        );
    }
    for (name, item) in &config.imus {
        state.imus.insert(
            name.clone(),
            item_from_defaults(defaults.get(&Hw::Imus), item)?,
        );
    }
    for (name, item) in &config.gnss {
        state.gnss.insert(
            name.clone(),
            item_from_defaults(defaults.get(&Hw::Gnss), item)?,
        );
    }
    Ok(state)
}

/// Actuator boards start from a deep copy of the actual state, except servos:
/// those come up disarmed unless the config names a `safe_angle`, in which
/// case the servo starts armed at it.
fn build_desired(config: &BoardConfig, state: &BoardState) -> BoardState {
    if !config.is_actuator {
        return BoardState::default();
    }
    let mut desired = state.clone();
    desired.servos.clear();
    for (name, servo_cfg) in &config.servos {
        let mut servo = ServoState {
            channel: servo_cfg.channel,
            ..Default::default()
        };
        if let Some(safe_angle) = servo_cfg.safe_angle {
            servo.armed = true;
            servo.angle = safe_angle;
        }
        desired.servos.insert(name.clone(), servo);
    }
    desired
}

// ── Tests ─────────────────────────────────────────────────────────────────────
