//! Board registry: brings boards up from configuration, hands them out by
//! name, and runs the whole-stand sweeps (disarm-all, scheduler pacing,
//! reload).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::board::Board;
use crate::config::{
    self, ConfigError, HardwareConfig, StateDefaults, HARDWARE_CONFIG_FILE,
};

/// Which scheduler cadence the current machine state wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPace {
    Idle,
    Active,
}

pub struct HardwareHandler {
    config_path: PathBuf,
    config: RwLock<HardwareConfig>,
    boards: RwLock<Vec<Arc<Board>>>,
}

impl HardwareHandler {
    /// Loads the canonical config and brings every board up. A missing or
    /// malformed config file refuses to initialize; a single board failing
    /// only costs that board.
    pub async fn initialise(config_dir: &Path) -> Result<Arc<Self>, ConfigError> {
        let config_path = config_dir.join(HARDWARE_CONFIG_FILE);
        let hardware_config = config::load_hardware_config(&config_path)?;
        let handler = Arc::new(Self {
            config_path,
            config: RwLock::new(hardware_config),
            boards: RwLock::new(Vec::new()),
        });
        handler.load_boards().await;
        Ok(handler)
    }

    async fn load_boards(&self) {
        let config = self.config.read().await.clone();
        let mut boards = self.boards.write().await;
        for (name, board_config) in &config.boards {
            match Board::initialise(name, board_config.clone(), &config.state_defaults).await {
                Ok(board) => boards.push(board),
                Err(e) => error!("failed to initialise board {name}: {e}"),
            }
        }
        info!("{} board(s) loaded", boards.len());
    }

    /// Shuts every board down and rebuilds the registry from the on-disk
    /// config. The old boards stay up if the new file does not parse.
    pub async fn reload(&self) -> Result<String, ConfigError> {
        let new_config = config::load_hardware_config(&self.config_path)?;
        self.unload().await;
        *self.config.write().await = new_config;
        self.load_boards().await;
        Ok("Hardware configuration reloaded".to_string())
    }

    /// Stops schedulers and transports for every board. Idempotent.
    pub async fn unload(&self) {
        let boards: Vec<_> = self.boards.write().await.drain(..).collect();
        for board in boards {
            board.shutdown().await;
        }
    }

    pub async fn get_board(&self, name: &str) -> Option<Arc<Board>> {
        self.boards
            .read()
            .await
            .iter()
            .find(|board| board.name == name)
            .cloned()
    }

    pub async fn boards(&self) -> Vec<Arc<Board>> {
        self.boards.read().await.clone()
    }

    pub async fn disarm_all(&self) {
        for board in self.boards().await {
            board.disarm_all().await;
        }
    }

    /// Switches every board's scheduler to its idle or active interval.
    pub async fn set_pace(&self, pace: SchedulerPace) {
        for board in self.boards().await {
            let interval = match pace {
                SchedulerPace::Idle => board.config.idle_pace(),
                SchedulerPace::Active => board.config.active_pace(),
            };
            board.poll_keeper().set_interval(interval);
        }
    }

    pub async fn state_defaults(&self) -> StateDefaults {
        self.config.read().await.state_defaults.clone()
    }

    pub async fn config_value(&self) -> Value {
        serde_json::to_value(&*self.config.read().await).unwrap_or(Value::Null)
    }

    /// Validates and persists a replacement hardware config; applied on the
    /// next reload.
    pub async fn save_config(&self, raw: &Value) -> Result<String, ConfigError> {
        config::save_hardware_config(&self.config_path, raw)?;
        Ok("Hardware configuration saved; reload to apply".to_string())
    }

    pub async fn states_value(&self) -> Value {
        let mut states = BTreeMap::new();
        for board in self.boards().await {
            states.insert(
                board.name.clone(),
                serde_json::to_value(board.state().await).unwrap_or(Value::Null),
            );
        }
        serde_json::to_value(states).unwrap_or(Value::Null)
    }

    pub async fn desired_states_value(&self) -> Value {
        let mut states = BTreeMap::new();
        for board in self.boards().await {
            states.insert(
                board.name.clone(),
                serde_json::to_value(board.desired_state().await).unwrap_or(Value::Null),
            );
        }
        serde_json::to_value(states).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) async fn offline_handler() -> Arc<HardwareHandler> {
        // Strip transports so no sockets open during tests.
        let mut raw: Value =
            serde_json::from_str(crate::config::tests::SAMPLE_CONFIG).expect("sample");
        for (_, board) in raw["boards"].as_object_mut().expect("boards").iter_mut() {
            board.as_object_mut().expect("board").remove("udp");
            board.as_object_mut().expect("board").remove("serial");
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(HARDWARE_CONFIG_FILE);
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(raw.to_string().as_bytes()).expect("write");
        // Keep the directory alive for the life of the handler.
        std::mem::forget(dir);
        HardwareHandler::initialise(path.parent().expect("parent"))
            .await
            .expect("handler init")
    }

    #[tokio::test]
    async fn boards_come_up_and_resolve_by_name() {
        let hardware = offline_handler().await;
        assert_eq!(hardware.boards().await.len(), 2);
        assert!(hardware.get_board("engine").await.is_some());
        assert!(hardware.get_board("sensing").await.is_some());
        assert!(hardware.get_board("ghost").await.is_none());
    }

    #[tokio::test]
    async fn disarm_all_sweeps_every_actuator_board() {
        let hardware = offline_handler().await;
        let engine = hardware.get_board("engine").await.expect("engine");
        // "main" starts armed via safe_angle.
        assert!(engine.desired_state().await.servos["main"].armed);

        hardware.disarm_all().await;
        let desired = engine.desired_state().await;
        assert!(!desired.servos["main"].armed);
        assert!(!desired.solenoids["n2_purge"].armed);
        assert!(!desired.pyros["igniter"].armed);
    }

    #[tokio::test]
    async fn unload_is_idempotent() {
        let hardware = offline_handler().await;
        hardware.unload().await;
        assert!(hardware.boards().await.is_empty());
        hardware.unload().await;
        assert!(hardware.boards().await.is_empty());
    }
}
