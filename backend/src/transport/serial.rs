//! Serial transport: newline-delimited UTF-8 JSON over a tokio serial port.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{error, info};

use super::{ingest_frame, PendingResponses, TransportError};
use crate::config::SerialConfig;

pub struct SerialLink {
    board: String,
    port: String,
    pending: Arc<PendingResponses>,
    writer: Mutex<WriteHalf<SerialStream>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SerialLink {
    pub async fn open(board: &str, cfg: &SerialConfig) -> Result<Self, TransportError> {
        let stream = tokio_serial::new(&cfg.port, cfg.baudrate)
            .open_native_async()
            .map_err(|source| TransportError::SerialOpen {
                port: cfg.port.clone(),
                source,
            })?;
        info!(
            "serial port {} opened at {} baud for board {board}",
            cfg.port, cfg.baudrate
        );

        let (read_half, write_half) = tokio::io::split(stream);
        let pending = Arc::new(PendingResponses::new());
        let reader = tokio::spawn(read_loop(read_half, pending.clone(), board.to_string()));
        let cleanup = tokio::spawn(pending.clone().run_cleanup());

        Ok(Self {
            board: board.to_string(),
            port: cfg.port.clone(),
            pending,
            writer: Mutex::new(write_half),
            tasks: vec![reader, cleanup],
        })
    }

    pub fn pending(&self) -> &Arc<PendingResponses> {
        &self.pending
    }

    pub fn board(&self) -> &str {
        &self.board
    }

    pub async fn write_frame(&self, raw: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(raw.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        info!("serial port {} closed for board {}", self.port, self.board);
    }
}

async fn read_loop(half: ReadHalf<SerialStream>, pending: Arc<PendingResponses>, board: String) {
    let mut lines = BufReader::new(half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => ingest_frame(&pending, &line, &board).await,
            Ok(None) => {
                // EOF on a serial port usually means the device went away.
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            Err(e) => {
                error!("board {board}: serial read error: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}
