use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::RwLock;
use tracing::{info, warn};

use stand_backend::board_log::BoardStateLogger;
use stand_backend::command_server;
use stand_backend::commands::CommandRouter;
use stand_backend::config::Settings;
use stand_backend::hardware::HardwareHandler;
use stand_backend::hotfire::HotfireController;
use stand_backend::state_machine::{
    self, MachineCtx, SharedMachine, StateMachine, MAIN_LOOP_CYCLE,
};
use stand_backend::time_keeper::TimeKeeper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stand_backend=info".into()),
        )
        .init();

    let settings = Settings::default();
    info!(
        "🚀 Ground control backend v{} starting — configs: {}, logs: {}",
        env!("CARGO_PKG_VERSION"),
        settings.config_dir.display(),
        settings.log_dir.display()
    );

    // Hardware: boards, transports, schedulers
    let hardware = HardwareHandler::initialise(&settings.config_dir)
        .await
        .context("hardware configuration")?;

    // Hotfire timeline
    let hotfire = HotfireController::load(&settings.config_dir).context("hotfire sequence")?;

    // State machine behind one lock, shared with the command router
    let time_keeper = Arc::new(TimeKeeper::new(
        "state-machine",
        MAIN_LOOP_CYCLE,
        Some(Duration::from_secs(60)),
    ));
    let ctx = MachineCtx {
        hardware: hardware.clone(),
        time_keeper,
        hotfire,
        log_dir: settings.log_dir.clone(),
    };
    let machine: SharedMachine = Arc::new(RwLock::new(StateMachine::start(ctx).await));

    // Operator command channel (UDP)
    let router = CommandRouter::new(machine.clone(), hardware.clone());
    tokio::spawn(command_server::run(settings.command_addr.clone(), router));

    // Continuous main-loop data log
    let main_log = match BoardStateLogger::create("mainloop", &hardware, &settings.log_dir).await {
        Ok(log) => Some(log),
        Err(e) => {
            warn!("main loop data log unavailable: {e:#}");
            None
        }
    };

    // Main loop until ctrl-c
    tokio::select! {
        _ = state_machine::run_main_loop(machine.clone(), hardware.clone(), main_log) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    hardware.unload().await;
    info!("backend stopped");
    Ok(())
}
