//! Operator command routing.
//!
//! Inbound datagrams carry one JSON object `{command, data}`; every reply is
//! `{command, response}`. Unknown verbs, malformed JSON and missing fields
//! all come back as diagnostic replies — nothing an operator sends can take
//! the backend down.

use std::sync::Arc;

use serde_json::{json, Value};
use stand_types::StateUpdate;
use tracing::warn;

use crate::hardware::HardwareHandler;
use crate::state_machine::SharedMachine;
use crate::states::StateKind;

pub struct CommandRouter {
    machine: SharedMachine,
    hardware: Arc<HardwareHandler>,
}

fn reply(command: &str, response: Value) -> String {
    json!({"command": command, "response": response}).to_string()
}

impl CommandRouter {
    pub fn new(machine: SharedMachine, hardware: Arc<HardwareHandler>) -> Self {
        Self { machine, hardware }
    }

    pub async fn process_message(&self, raw: &str) -> String {
        let Ok(message) = serde_json::from_str::<Value>(raw) else {
            warn!("invalid operator message: {raw}");
            return reply("Invalid Message", json!("Invalid JSON format"));
        };
        let command = message.get("command").and_then(Value::as_str);
        let data = message.get("data");
        let (Some(command), Some(data)) = (command, data) else {
            warn!("operator message without command/data: {raw}");
            return reply("Invalid Message", json!("Command not found in message"));
        };
        let response = self.dispatch(command, data).await;
        reply(command, response)
    }

    async fn dispatch(&self, command: &str, data: &Value) -> Value {
        match command {
            "get state" => json!(self.machine.read().await.kind().name()),
            "get time" => self.get_time().await,
            "get boards states" => self.hardware.states_value().await,
            "get boards desired states" => self.hardware.desired_states_value().await,
            "get hardware json" => self.hardware.config_value().await,
            "set hardware json" => match self.hardware.save_config(data).await {
                Ok(message) => json!(message),
                Err(e) => json!(format!("Invalid hardware config: {e}")),
            },
            "reload hardware json" => match self.hardware.reload().await {
                Ok(message) => json!(message),
                Err(e) => json!(format!("Reload failed: {e}")),
            },
            "update desired state" => self.update_desired_state(data).await,
            "disarm all" => {
                self.hardware.disarm_all().await;
                json!("All actuators disarmed")
            }
            "send receive" => self.send_receive(data).await,
            "get hotfire sequence" => self.machine.read().await.ctx.hotfire.sequence_value(),
            "set hotfire sequence" => {
                let mut machine = self.machine.write().await;
                match machine.ctx.hotfire.replace(data) {
                    Ok(()) => json!("Hotfire sequence updated"),
                    Err(e) => json!(format!("Invalid hotfire sequence: {e}")),
                }
            }
            "start hotfire sequence" => self.request_transition(StateKind::Hotfire).await,
            "abort engine" => self.request_transition(StateKind::EngineAbort).await,
            "fts" => self.request_transition(StateKind::Fts).await,
            "return to idle" => self.return_to_idle().await,
            _ => {
                warn!("unknown command: {command}");
                json!("Unknown command")
            }
        }
    }

    async fn get_time(&self) -> Value {
        let machine = self.machine.read().await;
        let hotfire_time = if machine.kind() == StateKind::Hotfire {
            let t = machine
                .ctx
                .hotfire
                .get_t(machine.ctx.time_keeper.time_since_statechange());
            if t > 0.0 {
                format!("T= +{t:.2} s")
            } else {
                format!("T= {t:.2} s")
            }
        } else {
            "T= Idling".to_string()
        };
        json!({
            "date_time": chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            "hotfire_time": hotfire_time,
        })
    }

    /// Route-level guard: during HOTFIRE the sequence engine owns every
    /// desired state, so operator merges are refused outright.
    async fn update_desired_state(&self, data: &Value) -> Value {
        if self.machine.read().await.kind() == StateKind::Hotfire {
            return json!("Desired state updates are locked out during Hotfire");
        }
        let Some(board_name) = data.get("board_name").and_then(Value::as_str) else {
            return json!("Missing key in data: board_name");
        };
        let Some(message) = data.get("message") else {
            return json!("Missing key in data: message");
        };
        let update: StateUpdate = match serde_json::from_value(message.clone()) {
            Ok(update) => update,
            Err(e) => return json!(format!("Invalid desired state payload: {e}")),
        };
        match self.hardware.get_board(board_name).await {
            Some(board) => {
                board.update_desired_state(&update).await;
                json!(format!("Desired state updated for board {board_name}"))
            }
            None => json!(format!("Board {board_name} not found")),
        }
    }

    /// One-shot operator-initiated exchange with a board; the correlated
    /// response (already folded into the actual state) is echoed back.
    async fn send_receive(&self, data: &Value) -> Value {
        let Some(board_name) = data.get("board_name").and_then(Value::as_str) else {
            return json!("Missing key in data: board_name");
        };
        let Some(message) = data.get("message") else {
            return json!("Missing key in data: message");
        };
        let Some(board) = self.hardware.get_board(board_name).await else {
            return json!(format!("Board {board_name} not found"));
        };
        if board.link().is_none() {
            return json!(format!("Board {board_name} has no transport"));
        }
        match board.send_receive(message.clone()).await {
            Some(response) => response,
            None => json!(format!("No response from board {board_name}")),
        }
    }

    async fn request_transition(&self, target: StateKind) -> Value {
        match self.machine.write().await.transition_to(target).await {
            Ok(message) => json!(message),
            Err(reason) => json!(reason),
        }
    }

    async fn return_to_idle(&self) -> Value {
        match self.machine.write().await.transition_to(StateKind::Idle).await {
            Ok(message) => {
                // Returning to Idle always leaves the stand safe.
                self.hardware.disarm_all().await;
                json!(message)
            }
            Err(reason) => json!(reason),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
