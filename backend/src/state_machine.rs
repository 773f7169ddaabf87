//! The operational state machine and its fixed-cadence main loop.
//!
//! The machine owns the current state and the context every state hook
//! receives (hardware registry, main-loop TimeKeeper, hotfire controller,
//! log directory). It is shared between the main loop and the command
//! router behind one `RwLock`; a transition runs
//! `teardown → install → epoch reset → setup` while holding the write lock,
//! so it is atomic with respect to both.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::board_log::BoardStateLogger;
use crate::hardware::HardwareHandler;
use crate::hotfire::HotfireController;
use crate::states::{OpState, StateKind};
use crate::time_keeper::TimeKeeper;

/// Main-loop cadence. Sub-10 ms median cycle latency is the target; 1 ms
/// keeps hotfire timing granular on a commodity SBC.
pub const MAIN_LOOP_CYCLE: Duration = Duration::from_millis(1);

/// Everything a state hook may touch. Passed by reference so states never
/// hold a pointer back to the machine.
pub struct MachineCtx {
    pub hardware: Arc<HardwareHandler>,
    pub time_keeper: Arc<TimeKeeper>,
    pub hotfire: HotfireController,
    pub log_dir: PathBuf,
}

pub type SharedMachine = Arc<RwLock<StateMachine>>;

pub struct StateMachine {
    state: OpState,
    pub ctx: MachineCtx,
}

impl StateMachine {
    pub async fn start(ctx: MachineCtx) -> StateMachine {
        let state = OpState::enter(StateKind::Startup, &ctx).await;
        info!("state machine started in {}", state.kind());
        StateMachine { state, ctx }
    }

    pub fn kind(&self) -> StateKind {
        self.state.kind()
    }

    /// Validated transition. On success the reply names the new state; on
    /// denial the current state and the state-change epoch are untouched and
    /// the reason comes back.
    pub async fn transition_to(&mut self, target: StateKind) -> Result<String, String> {
        if let Err(reason) = self.state.can_transition_to(target, &self.ctx) {
            let message = format!(
                "Transition from {} to {} denied: {reason}",
                self.kind(),
                target
            );
            warn!("{message}");
            return Err(message);
        }

        info!("transitioning from {} to {}", self.kind(), target);
        self.state.exit(&self.ctx).await;
        self.ctx.time_keeper.statechange();
        self.state = OpState::enter(target, &self.ctx).await;
        Ok(format!("Transitioned to {target}"))
    }

    /// One main-loop tick: run the current state's loop hook and apply any
    /// transition it requests.
    pub async fn tick(&mut self) {
        if let Some(next) = self.state.run(&self.ctx).await {
            if let Err(reason) = self.transition_to(next).await {
                warn!("state-requested transition failed: {reason}");
            }
        }
    }
}

/// The fixed-cadence main loop: tick the machine, sample the main-loop CSV
/// log every 10 cycles, sleep until the next deadline. Runs until the task
/// is dropped at shutdown.
pub async fn run_main_loop(
    machine: SharedMachine,
    hardware: Arc<HardwareHandler>,
    mut main_log: Option<BoardStateLogger>,
) {
    let time_keeper = machine.read().await.ctx.time_keeper.clone();
    loop {
        time_keeper.cycle_start();
        machine.write().await.tick().await;
        if time_keeper.get_cycle() % 10 == 0 {
            if let Some(log) = &mut main_log {
                log.write_row(&hardware).await;
            }
        }
        time_keeper.cycle_end().await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hardware::tests::offline_handler;
    use crate::hotfire::tests::{controller_from, ramp_sequence};
    use crate::states::STARTUP_HOLD_SECS;
    use serde_json::json;

    pub(crate) async fn test_machine() -> (tempfile::TempDir, StateMachine) {
        let hardware = offline_handler().await;
        let (seq_dir, hotfire) = controller_from(ramp_sequence());
        let time_keeper = Arc::new(TimeKeeper::new("test-machine", MAIN_LOOP_CYCLE, None));
        let log_dir = seq_dir.path().join("logs");
        let ctx = MachineCtx {
            hardware,
            time_keeper,
            hotfire,
            log_dir,
        };
        let machine = StateMachine::start(ctx).await;
        (seq_dir, machine)
    }

    async fn advance_secs(secs: f64) {
        tokio::time::advance(Duration::from_secs_f64(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn startup_auto_transitions_to_idle_and_disarms() {
        let (_dir, mut machine) = test_machine().await;
        assert_eq!(machine.kind(), StateKind::Startup);

        // Arm something so the disarm sweep is observable.
        let engine = machine.ctx.hardware.get_board("engine").await.expect("engine");
        assert!(engine.desired_state().await.servos["main"].armed);

        machine.tick().await;
        assert_eq!(machine.kind(), StateKind::Startup);

        advance_secs(STARTUP_HOLD_SECS + 0.1).await;
        machine.tick().await;
        assert_eq!(machine.kind(), StateKind::Idle);
        assert!(!engine.desired_state().await.servos["main"].armed);
    }

    #[tokio::test(start_paused = true)]
    async fn transition_matrix_from_startup_and_idle() {
        let (_dir, mut machine) = test_machine().await;

        // Startup: Hotfire and Launch are unreachable.
        assert!(machine.transition_to(StateKind::Hotfire).await.is_err());
        assert!(machine.transition_to(StateKind::Launch).await.is_err());
        assert!(machine.transition_to(StateKind::Idle).await.is_ok());

        // Idle: Hotfire, Launch, EngineAbort, FTS reachable; Hover is not.
        assert!(machine.transition_to(StateKind::Hover).await.is_err());
        assert_eq!(machine.kind(), StateKind::Idle);
        assert!(machine.transition_to(StateKind::Launch).await.is_ok());
        assert!(machine.transition_to(StateKind::Hover).await.is_ok());
        assert!(machine.transition_to(StateKind::Idle).await.is_ok());
        assert!(machine.transition_to(StateKind::Fts).await.is_ok());
        assert!(machine.transition_to(StateKind::Idle).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn hotfire_cannot_return_to_idle_until_complete() {
        let (_dir, mut machine) = test_machine().await;
        machine.transition_to(StateKind::Idle).await.expect("to idle");
        machine
            .transition_to(StateKind::Hotfire)
            .await
            .expect("to hotfire");

        // Mid-sequence: denied, state unchanged, epoch untouched.
        advance_secs(1.0).await;
        let before = machine.ctx.time_keeper.time_since_statechange();
        let denied = machine.transition_to(StateKind::Idle).await;
        assert!(denied.is_err());
        assert_eq!(machine.kind(), StateKind::Hotfire);
        assert!(
            (machine.ctx.time_keeper.time_since_statechange() - before).abs() < 1e-6,
            "denied transition must not reset the epoch"
        );

        // Past last keyframe + safing (t_since > 5 s for the ramp sequence).
        advance_secs(4.5).await;
        assert!(machine.transition_to(StateKind::Idle).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn hotfire_auto_exits_and_disarms_when_complete() {
        let (_dir, mut machine) = test_machine().await;
        machine.transition_to(StateKind::Idle).await.expect("to idle");

        // Arm the sequenced servo so hotfire can drive it.
        let engine = machine.ctx.hardware.get_board("engine").await.expect("engine");
        engine
            .update_state(
                &serde_json::from_str(r#"{"servos": {"main": {"armed": true}}}"#).expect("arm"),
            )
            .await;

        machine
            .transition_to(StateKind::Hotfire)
            .await
            .expect("to hotfire");
        machine.tick().await;
        assert_eq!(machine.kind(), StateKind::Hotfire);

        // Run past the end of the timeline; the loop notices completion,
        // disarms and returns to Idle on its own.
        advance_secs(5.1).await;
        machine.tick().await;
        assert_eq!(machine.kind(), StateKind::Idle);
        assert!(!engine.desired_state().await.servos["main"].armed);
    }

    #[tokio::test(start_paused = true)]
    async fn hotfire_pushes_the_timeline_to_named_boards() {
        let (_dir, mut machine) = test_machine().await;
        machine.transition_to(StateKind::Idle).await.expect("to idle");

        // The ramp sequence names board "B"; retarget it at the engine board
        // and arm the servo it drives.
        let seq = json!({
            "time_before_ignition": 0.5,
            "hotfire_safing_time": 1.0,
            "start_end_desiredstate": {
                "engine": {"servos": {"main": {"powered": false}}}
            },
            "sequence": {
                "0.0": {"engine": {"servos": {"main": {"angle": 0.0, "ramp_to_next": true}}}},
                "2.0": {"engine": {"servos": {"main": {"angle": 90.0}}}}
            }
        });
        machine.ctx.hotfire.replace(&seq).expect("replace");
        let engine = machine.ctx.hardware.get_board("engine").await.expect("engine");
        engine
            .update_state(
                &serde_json::from_str(r#"{"servos": {"main": {"armed": true}}}"#).expect("arm"),
            )
            .await;

        machine
            .transition_to(StateKind::Hotfire)
            .await
            .expect("to hotfire");

        // T = 1.0: halfway up the ramp.
        advance_secs(1.5).await;
        machine.tick().await;
        assert_eq!(engine.desired_state().await.servos["main"].angle, 45.0);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_cooldown_gates_the_return_to_idle() {
        let (_dir, mut machine) = test_machine().await;
        machine.transition_to(StateKind::Idle).await.expect("to idle");
        machine
            .transition_to(StateKind::EngineAbort)
            .await
            .expect("to abort");

        advance_secs(1.5).await;
        let denied = machine.transition_to(StateKind::Idle).await;
        let reason = denied.expect_err("cooldown should deny");
        assert!(reason.contains("2 seconds"));
        assert_eq!(machine.kind(), StateKind::EngineAbort);

        advance_secs(0.6).await;
        assert!(machine.transition_to(StateKind::Idle).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_pushes_the_safing_snapshot_every_tick() {
        let (_dir, mut machine) = test_machine().await;
        machine.transition_to(StateKind::Idle).await.expect("to idle");

        let seq = json!({
            "time_before_ignition": 0.0,
            "hotfire_safing_time": 1.0,
            "start_end_desiredstate": {
                "engine": {"solenoids": {"n2_purge": {"armed": true, "powered": true}}}
            },
            "sequence": {
                "0.0": {"engine": {"solenoids": {"n2_purge": {"powered": false}}}}
            }
        });
        machine.ctx.hotfire.replace(&seq).expect("replace");

        // The solenoid reports armed, so the safing snapshot can drive it.
        let engine = machine.ctx.hardware.get_board("engine").await.expect("engine");
        engine
            .update_state(
                &serde_json::from_str(r#"{"solenoids": {"n2_purge": {"armed": true}}}"#)
                    .expect("arm"),
            )
            .await;

        machine
            .transition_to(StateKind::EngineAbort)
            .await
            .expect("to abort");
        machine.tick().await;

        let desired = engine.desired_state().await;
        assert!(desired.solenoids["n2_purge"].armed);
        assert!(desired.solenoids["n2_purge"].powered);
    }

    #[tokio::test(start_paused = true)]
    async fn launch_and_hover_follow_the_matrix() {
        let (_dir, mut machine) = test_machine().await;
        machine.transition_to(StateKind::Idle).await.expect("to idle");
        machine
            .transition_to(StateKind::Launch)
            .await
            .expect("to launch");

        assert!(machine.transition_to(StateKind::Idle).await.is_err());
        assert!(machine.transition_to(StateKind::Hover).await.is_ok());
        assert!(machine.transition_to(StateKind::Launch).await.is_err());
        assert!(machine.transition_to(StateKind::EngineAbort).await.is_ok());
        assert!(machine.transition_to(StateKind::Hotfire).await.is_err());
    }
}
