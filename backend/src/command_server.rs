//! Operator command channel: one JSON object per UDP datagram, reply to the
//! datagram source.
//!
//! Runs as its own task next to the main loop. Errors never take the server
//! down — a bad datagram costs only its own reply.

use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::commands::CommandRouter;

/// Logical payload cap; transport MTU applies below this.
const MAX_DATAGRAM: usize = 64 * 1024;

pub async fn run(addr: String, router: CommandRouter) {
    let socket = match UdpSocket::bind(&addr).await {
        Ok(socket) => {
            info!("operator command channel listening on {addr}");
            socket
        }
        Err(e) => {
            error!("could not bind operator command channel {addr}: {e}");
            return;
        }
    };

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                let message = String::from_utf8_lossy(&buf[..len]);
                let message = message.trim();
                debug!("operator command from {src}: {message}");
                let response = router.process_message(message).await;
                if let Err(e) = socket.send_to(response.as_bytes(), src).await {
                    warn!("operator reply to {src} failed: {e}");
                }
            }
            Err(e) => warn!("operator channel recv error: {e}"),
        }
    }
}
