//! Ground control backend for the liquid-engine test stand and hopper.
//!
//! The core is three subsystems:
//! - the operational state machine (Startup / Idle / Hotfire / Engine Abort /
//!   FTS / Launch / Hover) driving a fixed-cadence main loop
//! - the hotfire controller executing a pre-authored, ramp-aware actuator
//!   timeline against T-time
//! - one I/O scheduler per board exchanging correlated JSON frames over
//!   serial or UDP and mirroring each device's actual and desired state,
//!   with an arming firewall between operators and anything that moves
//!
//! Everything long-running is a tokio task; the binary in `main.rs` wires
//! the pieces together.

pub mod board;
pub mod board_log;
pub mod command_server;
pub mod commands;
pub mod config;
pub mod hardware;
pub mod hotfire;
pub mod scheduler;
pub mod state_machine;
pub mod states;
pub mod time_keeper;
pub mod transport;
