//! Operational states and the transition rules between them.
//!
//! The seven states are a closed sum type; per-state data (the hotfire CSV
//! log) lives inside the variant. Hooks receive the machine context instead
//! of holding a back-reference to the machine. The transition matrix is a
//! pure function over the `(from, to)` pair plus two runtime gates:
//! Hotfire→Idle requires the sequence to be complete, EngineAbort→Idle
//! requires the cool-down to have elapsed.

use tracing::{info, warn};

use crate::board_log::BoardStateLogger;
use crate::hardware::SchedulerPace;
use crate::state_machine::MachineCtx;

/// Seconds Startup holds before auto-transitioning to Idle.
pub const STARTUP_HOLD_SECS: f64 = 5.0;
/// Seconds EngineAbort must be held before Idle may be re-entered.
pub const ABORT_COOLDOWN_SECS: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Startup,
    Idle,
    Hotfire,
    EngineAbort,
    Fts,
    Launch,
    Hover,
}

impl StateKind {
    pub fn name(self) -> &'static str {
        match self {
            StateKind::Startup => "Startup",
            StateKind::Idle => "Idle",
            StateKind::Hotfire => "Hotfire",
            StateKind::EngineAbort => "Engine Abort",
            StateKind::Fts => "FTS",
            StateKind::Launch => "Launch",
            StateKind::Hover => "Hover",
        }
    }
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub struct HotfireRun {
    log: Option<BoardStateLogger>,
}

pub enum OpState {
    Startup,
    Idle,
    Hotfire(HotfireRun),
    EngineAbort,
    Fts,
    Launch,
    Hover,
}

impl OpState {
    pub fn kind(&self) -> StateKind {
        match self {
            OpState::Startup => StateKind::Startup,
            OpState::Idle => StateKind::Idle,
            OpState::Hotfire(_) => StateKind::Hotfire,
            OpState::EngineAbort => StateKind::EngineAbort,
            OpState::Fts => StateKind::Fts,
            OpState::Launch => StateKind::Launch,
            OpState::Hover => StateKind::Hover,
        }
    }

    /// Builds the target state and runs its setup side effects.
    pub async fn enter(kind: StateKind, ctx: &MachineCtx) -> OpState {
        match kind {
            StateKind::Startup => OpState::Startup,
            StateKind::Idle => {
                ctx.hardware.set_pace(SchedulerPace::Idle).await;
                OpState::Idle
            }
            StateKind::Hotfire => {
                ctx.hardware.set_pace(SchedulerPace::Active).await;
                let log = match BoardStateLogger::create("hotfire", &ctx.hardware, &ctx.log_dir)
                    .await
                {
                    Ok(log) => Some(log),
                    Err(e) => {
                        warn!("hotfire data log unavailable: {e:#}");
                        None
                    }
                };
                OpState::Hotfire(HotfireRun { log })
            }
            StateKind::EngineAbort => OpState::EngineAbort,
            StateKind::Fts => OpState::Fts,
            StateKind::Launch => OpState::Launch,
            StateKind::Hover => OpState::Hover,
        }
    }

    /// One main-loop tick. Returns the state the machine should transition
    /// to, if any.
    pub async fn run(&mut self, ctx: &MachineCtx) -> Option<StateKind> {
        match self {
            OpState::Startup => {
                if ctx.time_keeper.time_since_statechange() > STARTUP_HOLD_SECS {
                    ctx.hardware.disarm_all().await;
                    return Some(StateKind::Idle);
                }
                None
            }
            OpState::Idle | OpState::Fts => None,
            // Flight states are stubs in this revision; no control law runs.
            OpState::Launch | OpState::Hover => None,
            OpState::Hotfire(hotfire_run) => {
                let t_since = ctx.time_keeper.time_since_statechange();
                let t = ctx.hotfire.get_t(t_since);
                if ctx.time_keeper.get_cycle() % 100 == 0 {
                    info!("T{t:+.0}s");
                }

                let snapshot = ctx.hotfire.desiredstate(t_since);
                for (board_name, update) in &snapshot {
                    match ctx.hardware.get_board(board_name).await {
                        Some(board) => board.update_desired_state(update).await,
                        None => {
                            warn!("board {board_name} named in hotfire sequence not found")
                        }
                    }
                }

                if let Some(log) = &mut hotfire_run.log {
                    log.write_row(&ctx.hardware).await;
                }

                if ctx.hotfire.is_complete(t_since) {
                    info!("hotfire complete at T{t:+.0}s");
                    ctx.hardware.disarm_all().await;
                    return Some(StateKind::Idle);
                }
                None
            }
            OpState::EngineAbort => {
                for (board_name, update) in ctx.hotfire.abort_desiredstate() {
                    match ctx.hardware.get_board(&board_name).await {
                        Some(board) => board.update_desired_state(&update).await,
                        None => {
                            warn!("board {board_name} named in safing snapshot not found")
                        }
                    }
                }
                None
            }
        }
    }

    pub async fn exit(&mut self, _ctx: &MachineCtx) {
        if let OpState::Hotfire(hotfire_run) = self {
            if let Some(log) = hotfire_run.log.take() {
                log.close();
            }
        }
    }

    /// The transition matrix. Denied transitions return the reason and leave
    /// everything untouched.
    pub fn can_transition_to(&self, target: StateKind, ctx: &MachineCtx) -> Result<(), String> {
        use StateKind::*;

        let from = self.kind();
        if from == target {
            return Err(format!("Already in {from} state"));
        }
        match (from, target) {
            (Startup, Idle) | (Startup, EngineAbort) | (Startup, Fts) => Ok(()),

            (Idle, Hotfire) | (Idle, EngineAbort) | (Idle, Fts) | (Idle, Launch) => Ok(()),

            (Hotfire, Idle) => {
                if ctx
                    .hotfire
                    .is_complete(ctx.time_keeper.time_since_statechange())
                {
                    Ok(())
                } else {
                    Err("Hotfire sequence not complete".to_string())
                }
            }
            (Hotfire, EngineAbort) | (Hotfire, Fts) => Ok(()),

            (EngineAbort, Idle) => {
                let elapsed = ctx.time_keeper.time_since_statechange();
                if elapsed >= ABORT_COOLDOWN_SECS {
                    Ok(())
                } else {
                    Err(format!(
                        "Cannot return to Idle only {elapsed:.1} seconds after abort; \
                         2 seconds required"
                    ))
                }
            }
            (EngineAbort, Fts) => Ok(()),

            (Fts, Idle) => Ok(()),

            (Launch, Hover) | (Launch, EngineAbort) | (Launch, Fts) => Ok(()),

            (Hover, Idle) | (Hover, EngineAbort) | (Hover, Fts) => Ok(()),

            _ => Err(format!("Invalid transition from {from} to {target}")),
        }
    }
}
