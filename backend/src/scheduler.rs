//! Per-board command scheduler.
//!
//! One task per board, paced by the board's own TimeKeeper at its configured
//! polling interval. Each tick builds the appropriate frame (sensor query or
//! actuator write) and fires it through `send_receive` without waiting for
//! the response — the correlated reply folds into the board's actual state
//! whenever it lands, so a slow board never stalls its own polling cadence.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::board::Board;

pub fn spawn(board: Arc<Board>) -> JoinHandle<()> {
    tokio::spawn(run(board))
}

async fn run(board: Arc<Board>) {
    let keeper = board.poll_keeper().clone();
    debug!("command scheduler started for board {}", board.name);
    loop {
        keeper.cycle_start();
        let frame = board.poll_frame().await;
        let exchange = board.clone();
        tokio::spawn(async move {
            // Response handling (update_state) happens inside send_receive;
            // timeouts are logged there.
            let _ = exchange.send_receive(frame).await;
        });
        keeper.cycle_end().await;
    }
}
