//! Board transports: framed JSON request/response with correlation IDs.
//!
//! Both variants (serial line-delimited, UDP datagram-delimited) share one
//! contract: every outbound frame gets a unique monotonically increasing
//! `send_id`, the device echoes it in its response, and the sender waits up
//! to [`RESPONSE_TIMEOUT`] for the echo. Responses that nobody claims are
//! garbage-collected so a late frame can never be correlated to a later
//! request.
//!
//! Three cooperating pieces per link:
//! - `send_receive` writes a frame and waits on the pending buffer
//! - the reader task parses inbound frames into the pending buffer
//! - the cleanup task evicts pending entries past their deadline

mod serial;
mod udp;

pub use serial::SerialLink;
pub use udp::UdpLink;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// How long a request waits for its echoed `send_id`, and how long an
/// unclaimed response lives in the pending buffer.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll period while a waiter watches the pending buffer.
const CLAIM_POLL: Duration = Duration::from_millis(1);

/// Cleanup task idle sleep when the queue is empty.
const CLEANUP_IDLE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port {port}: {source}")]
    SerialOpen {
        port: String,
        source: tokio_serial::Error,
    },
    #[error("udp endpoint {addr}: {source}")]
    UdpOpen {
        addr: String,
        source: std::io::Error,
    },
}

// ── Pending-response buffer ───────────────────────────────────────────────────

/// Correlation state shared by the waiter, the reader task and the cleanup
/// task of one link.
pub struct PendingResponses {
    buffer: Mutex<HashMap<u64, Value>>,
    /// `(deadline, send_id)` pairs; appended unordered, evicted sorted.
    cleanup_queue: Mutex<Vec<(Instant, u64)>>,
    next_send_id: AtomicU64,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(HashMap::new()),
            cleanup_queue: Mutex::new(Vec::new()),
            next_send_id: AtomicU64::new(0),
        }
    }

    /// Unique per-link correlation ID, strictly increasing for the lifetime
    /// of the process.
    pub fn allocate_id(&self) -> u64 {
        self.next_send_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Called by the reader task for every inbound frame carrying a
    /// `send_id`. The entry is also queued for eviction at `now + 1 s` in
    /// case its waiter already gave up.
    pub async fn stash(&self, send_id: u64, frame: Value) {
        self.buffer.lock().await.insert(send_id, frame);
        self.cleanup_queue
            .lock()
            .await
            .push((Instant::now() + RESPONSE_TIMEOUT, send_id));
    }

    /// Waits up to [`RESPONSE_TIMEOUT`] for the response carrying `send_id`.
    pub async fn claim(&self, send_id: u64) -> Option<Value> {
        let wait = async {
            loop {
                if let Some(frame) = self.buffer.lock().await.remove(&send_id) {
                    return frame;
                }
                tokio::time::sleep(CLAIM_POLL).await;
            }
        };
        tokio::time::timeout(RESPONSE_TIMEOUT, wait).await.ok()
    }

    /// Cleanup task body: wake at the earliest deadline, evict expired
    /// entries that were never claimed.
    pub async fn run_cleanup(self: Arc<Self>) {
        loop {
            let next_deadline = {
                let mut queue = self.cleanup_queue.lock().await;
                queue.sort_by_key(|(deadline, _)| *deadline);
                let now = Instant::now();
                while queue.first().is_some_and(|(deadline, _)| *deadline < now) {
                    let (_, send_id) = queue.remove(0);
                    if self.buffer.lock().await.remove(&send_id).is_some() {
                        debug!("evicted unclaimed response with send_id {send_id}");
                    }
                }
                queue.first().map(|(deadline, _)| *deadline)
            };
            match next_deadline {
                Some(deadline) => {
                    let earliest = Instant::now() + CLEANUP_IDLE;
                    tokio::time::sleep_until(deadline.max(earliest)).await;
                }
                None => tokio::time::sleep(CLEANUP_IDLE).await,
            }
        }
    }

    #[cfg(test)]
    pub async fn pending_len(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

impl Default for PendingResponses {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared by both reader tasks: decode one inbound frame and stash it if it
/// carries a `send_id`. Malformed frames are logged and dropped.
pub(crate) async fn ingest_frame(pending: &PendingResponses, raw: &str, board: &str) {
    let raw = raw.trim();
    if raw.is_empty() {
        return;
    }
    debug!("board {board} received: {raw}");
    match serde_json::from_str::<Value>(raw) {
        Ok(frame) => match frame.get("send_id").and_then(Value::as_u64) {
            Some(send_id) => pending.stash(send_id, frame).await,
            None => debug!("board {board}: frame without send_id discarded"),
        },
        Err(e) => error!("board {board}: JSON decode error: {e}: {raw}"),
    }
}

// ── Link front-end ────────────────────────────────────────────────────────────

/// One board's transport, either flavor.
pub enum BoardLink {
    Serial(SerialLink),
    Udp(UdpLink),
}

impl BoardLink {
    fn pending(&self) -> &Arc<PendingResponses> {
        match self {
            BoardLink::Serial(link) => link.pending(),
            BoardLink::Udp(link) => link.pending(),
        }
    }

    fn board(&self) -> &str {
        match self {
            BoardLink::Serial(link) => link.board(),
            BoardLink::Udp(link) => link.board(),
        }
    }

    async fn write_frame(&self, raw: &str) -> std::io::Result<()> {
        match self {
            BoardLink::Serial(link) => link.write_frame(raw).await,
            BoardLink::Udp(link) => link.write_frame(raw).await,
        }
    }

    /// Attaches a fresh `send_id` to `payload`, writes the frame, and waits
    /// for the correlated response. Timeouts and transient write errors are
    /// logged and swallowed; the caller sees `None`.
    pub async fn send_receive(&self, mut payload: Value) -> Option<Value> {
        let Value::Object(map) = &mut payload else {
            warn!("board {}: refusing to send non-object frame", self.board());
            return None;
        };
        let send_id = self.pending().allocate_id();
        map.insert("send_id".into(), send_id.into());

        let raw = payload.to_string();
        debug!("board {} sending: {raw}", self.board());
        if let Err(e) = self.write_frame(&raw).await {
            warn!("board {}: send failed: {e}", self.board());
            return None;
        }

        match self.pending().claim(send_id).await {
            Some(frame) => Some(frame),
            None => {
                warn!(
                    "board {}: timeout waiting for response with send_id {send_id}",
                    self.board()
                );
                None
            }
        }
    }

    /// Cancels the reader and cleanup tasks. Idempotent; the underlying
    /// socket/port closes when the link is dropped.
    pub fn shutdown(&self) {
        match self {
            BoardLink::Serial(link) => link.shutdown(),
            BoardLink::Udp(link) => link.shutdown(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn send_ids_are_strictly_monotonic() {
        let pending = PendingResponses::new();
        let mut last = None;
        for _ in 0..100 {
            let id = pending.allocate_id();
            if let Some(prev) = last {
                assert!(id > prev);
            }
            last = Some(id);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn claim_returns_a_stashed_frame() {
        let pending = Arc::new(PendingResponses::new());
        let id = pending.allocate_id();

        let waiter = {
            let pending = pending.clone();
            tokio::spawn(async move { pending.claim(id).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        pending.stash(id, json!({"send_id": id, "ok": true})).await;

        let frame = waiter.await.unwrap().expect("claim should succeed");
        assert_eq!(frame["ok"], json!(true));
        assert_eq!(pending.pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn claim_times_out_after_one_second() {
        let pending = PendingResponses::new();
        let started = Instant::now();
        assert!(pending.claim(42).await.is_none());
        assert_eq!(Instant::now() - started, RESPONSE_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimed_responses_are_evicted_not_recorrelated() {
        let pending = Arc::new(PendingResponses::new());
        let cleanup = tokio::spawn(pending.clone().run_cleanup());

        // A response arrives after its waiter already timed out.
        let stale_id = pending.allocate_id();
        pending.stash(stale_id, json!({"send_id": stale_id})).await;
        assert_eq!(pending.pending_len().await, 1);

        // Past the deadline the cleanup task removes it.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(pending.pending_len().await, 0);

        // A new claim for the same id must not see the stale frame.
        let started = Instant::now();
        assert!(pending.claim(stale_id).await.is_none());
        assert_eq!(Instant::now() - started, RESPONSE_TIMEOUT);

        cleanup.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn frames_without_send_id_are_discarded() {
        let pending = PendingResponses::new();
        ingest_frame(&pending, r#"{"pts": {"p0": {"value": 1.0}}}"#, "test").await;
        ingest_frame(&pending, "not json at all", "test").await;
        ingest_frame(&pending, "", "test").await;
        assert_eq!(pending.pending_len().await, 0);

        ingest_frame(&pending, r#"{"send_id": 9}"#, "test").await;
        assert_eq!(pending.pending_len().await, 1);
    }
}
