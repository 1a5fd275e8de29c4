//! Line-framed JSON-RPC 2.0 codec for the upstream Stratum dialect.
//!
//! One JSON object per `\n`-terminated line. Outgoing requests carry a
//! proxy-local `worker` field (pools ignore it) used to attribute shares in
//! the submit log. Incoming lines are either responses (non-zero `id`
//! matching a pending request) or job notifications (`id` absent or zero,
//! bare `result` array).

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, warn};

use super::UpstreamError;

/// Lines longer than this close the transport.
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Largest request id issued before the counter wraps back to 2.
/// Ids 0 and 1 are reserved for the connection handshake and never issued.
const MAX_REQUEST_ID: u16 = 65534;

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: Option<u16>,
    method: &'a str,
    params: &'a Value,
    jsonrpc: &'static str,
    worker: &'a str,
}

/// Serialize one outgoing request line, newline included.
pub fn encode_request(id: Option<u16>, method: &str, params: &Value, worker: &str) -> String {
    let req = Request { id, method, params, jsonrpc: "2.0", worker };
    let mut line = serde_json::to_string(&req).expect("request serialization cannot fail");
    line.push('\n');
    line
}

#[derive(Debug, Deserialize)]
struct Wire {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

/// A classified incoming line.
#[derive(Debug)]
pub enum Incoming {
    /// Correlates with a pending request by id.
    Response { id: u16, result: Value, error: Value },
    /// New-job broadcast; pools send these with `id` 0 or absent and the job
    /// tuple directly in `result`, whatever the stated method says.
    Notification { result: Value },
}

/// Classify one incoming line. `Err` means the line is not JSON and the
/// transport should be closed.
pub fn parse_line(line: &str) -> Result<Incoming, serde_json::Error> {
    let wire: Wire = serde_json::from_str(line)?;
    let id = wire.id.as_ref().and_then(Value::as_u64).unwrap_or(0);
    if id == 0 {
        Ok(Incoming::Notification { result: wire.result })
    } else {
        Ok(Incoming::Response {
            id: id.min(u16::MAX as u64) as u16,
            result: wire.result,
            error: wire.error,
        })
    }
}

/// One RPC awaiting its reply.
struct PendingRequest {
    method: String,
    worker: String,
    sent_at: Instant,
    tx: oneshot::Sender<Result<Value, UpstreamError>>,
}

/// Request id allocation plus the id -> pending-request correlation table.
/// At most one entry exists per issued id; resolving removes the entry.
pub struct PendingMap {
    counter: u16,
    entries: HashMap<u16, PendingRequest>,
}

impl PendingMap {
    pub fn new() -> Self {
        Self { counter: 1, entries: HashMap::new() }
    }

    fn next_id(&mut self) -> u16 {
        self.counter += 1;
        if self.counter > MAX_REQUEST_ID {
            self.counter = 2;
        }
        self.counter
    }

    /// Allocate an id and register the pending entry for it.
    pub fn register(
        &mut self,
        method: &str,
        worker: &str,
    ) -> (u16, oneshot::Receiver<Result<Value, UpstreamError>>) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                worker: worker.to_string(),
                sent_at: Instant::now(),
                tx,
            },
        );
        (id, rx)
    }

    /// Fulfil the pending request for `id`. Returns false when no entry is
    /// registered under that id (a protocol error on the wire).
    pub fn resolve(&mut self, id: u16, result: Value, error: Value) -> bool {
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        if entry.method == "eth_submitWork" {
            let ms = entry.sent_at.elapsed().as_millis();
            if result == Value::Bool(true) {
                info!("[{}ms] eth_submitWork from '{}' accepted", ms, entry.worker);
            } else {
                warn!("[{}ms] eth_submitWork from '{}' REJECTED", ms, entry.worker);
            }
        }
        let outcome = if error.is_null() {
            Ok(result)
        } else {
            Err(UpstreamError::Remote(error.to_string()))
        };
        let _ = entry.tx.send(outcome);
        true
    }

    /// Drop every pending entry; their receivers observe `TransportClosed`.
    pub fn abandon_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            let _ = entry.tx.send(Err(UpstreamError::TransportClosed));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingMap {
    fn default() -> Self {
        Self::new()
    }
}
