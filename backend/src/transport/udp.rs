//! UDP transport: one datagram per UTF-8 JSON frame, connected to the
//! board's remote endpoint.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{ingest_frame, PendingResponses, TransportError};
use crate::config::UdpConfig;

pub struct UdpLink {
    board: String,
    addr: String,
    socket: Arc<UdpSocket>,
    pending: Arc<PendingResponses>,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpLink {
    pub async fn open(board: &str, cfg: &UdpConfig) -> Result<Self, TransportError> {
        let addr = format!("{}:{}", cfg.ip, cfg.port);
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|source| TransportError::UdpOpen {
                addr: addr.clone(),
                source,
            })?;
        socket
            .connect(&addr)
            .await
            .map_err(|source| TransportError::UdpOpen {
                addr: addr.clone(),
                source,
            })?;
        info!("udp connection established to {addr} for board {board}");

        let socket = Arc::new(socket);
        let pending = Arc::new(PendingResponses::new());
        let reader = tokio::spawn(read_loop(
            socket.clone(),
            pending.clone(),
            board.to_string(),
        ));
        let cleanup = tokio::spawn(pending.clone().run_cleanup());

        Ok(Self {
            board: board.to_string(),
            addr,
            socket,
            pending,
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
        self.socket.send(raw.as_bytes()).await.map(|_| ())
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        info!("udp connection to {} closed for board {}", self.addr, self.board);
    }
}

async fn read_loop(socket: Arc<UdpSocket>, pending: Arc<PendingResponses>, board: String) {
    let mut buf = vec![0u8; 8192];
    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => match std::str::from_utf8(&buf[..len]) {
                Ok(raw) => ingest_frame(&pending, raw, &board).await,
                Err(e) => warn!("board {board}: datagram was not UTF-8: {e}"),
            },
            Err(e) => {
                error!("board {board}: udp recv error: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}
