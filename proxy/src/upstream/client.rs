//! Reconnecting TCP client for one upstream pool.
//!
//! Each configured pool gets one client that dials, speaks the line-JSON
//! codec, and keeps retrying with exponential backoff until `stop()` clears
//! the reconnection flag at shutdown. Lifecycle and job events are fanned
//! out on a broadcast channel so the session controller and the orchestrator
//! can both observe them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::codec::{self, Incoming, PendingMap, MAX_LINE_LENGTH};
use super::UpstreamError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Lifecycle and job events observed on one upstream connection.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Connected,
    /// A dial attempt failed or timed out; the dialer keeps retrying.
    ConnectFailed,
    Disconnected,
    /// Result payload of a job notification, or of an RPC reply that carried
    /// a fresh work array instead of a plain ack.
    Job(Value),
}

pub struct UpstreamClient {
    name: String,
    host: String,
    port: u16,
    is_failover: bool,
    debug_wire: bool,
    reconnecting: AtomicBool,
    connected: AtomicBool,
    remote_ip: StdMutex<Option<String>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    pending: StdMutex<PendingMap>,
    events: broadcast::Sender<UpstreamEvent>,
    /// Fires to force-drop the current transport (or cut a backoff sleep).
    kick: Notify,
    /// Shared idle-watchdog feed, poked on every inbound line.
    activity: Arc<Notify>,
}

impl UpstreamClient {
    pub fn new(
        name: &str,
        host: &str,
        port: u16,
        is_failover: bool,
        debug_wire: bool,
        activity: Arc<Notify>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            is_failover,
            debug_wire,
            reconnecting: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            remote_ip: StdMutex::new(None),
            writer: Mutex::new(None),
            pending: StdMutex::new(PendingMap::new()),
            events,
            kick: Notify::new(),
            activity,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_failover(&self) -> bool {
        self.is_failover
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Last observed peer address, for the status page.
    pub fn remote_ip(&self) -> Option<String> {
        self.remote_ip.lock().unwrap().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpstreamEvent> {
        self.events.subscribe()
    }

    /// Force-drop the current transport and re-dial immediately.
    pub fn reconnect(&self) {
        self.kick.notify_one();
    }

    /// Terminal: stop reconnecting. Called once at shutdown.
    pub fn stop(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
        self.kick.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn force_connected(&self, on: bool) {
        self.connected.store(on, Ordering::SeqCst);
    }

    /// Send one request and await the correlated reply. Fails synchronously
    /// with `NotConnected` when there is no live transport; in-flight
    /// requests fail with `TransportClosed` when the transport drops.
    pub async fn rpc(&self, method: &str, params: Value, worker: &str) -> Result<Value, UpstreamError> {
        if !self.is_connected() {
            return Err(UpstreamError::NotConnected);
        }
        let (id, rx) = self.pending.lock().unwrap().register(method, worker);
        let line = codec::encode_request(Some(id), method, &params, worker);
        if self.debug_wire {
            debug!("[{}] < {}", self.name, line.trim_end());
        }
        {
            let mut writer = self.writer.lock().await;
            if let Some(w) = writer.as_mut() {
                // A failed write means the transport just died; the read
                // loop notices and abandons the pending entry.
                if let Err(e) = w.write_all(line.as_bytes()).await {
                    debug!("[{}] write failed: {}", self.name, e);
                }
            }
        }
        rx.await.map_err(|_| UpstreamError::TransportClosed)?
    }

    pub fn spawn(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.run().await });
    }

    /// Dial loop: Idle -> Dialing -> Connected -> Closing -> Idle, with
    /// exponential backoff between attempts, until `stop()` is called.
    pub async fn run(self: Arc<Self>) {
        let mut delay = INITIAL_BACKOFF;
        while self.is_reconnecting() {
            match timeout(CONNECT_TIMEOUT, TcpStream::connect((self.host.as_str(), self.port))).await {
                Ok(Ok(stream)) => {
                    delay = INITIAL_BACKOFF;
                    self.session(stream).await;
                }
                Ok(Err(e)) => {
                    warn!("[{}] connect to {}:{} failed: {}", self.name, self.host, self.port, e);
                    let _ = self.events.send(UpstreamEvent::ConnectFailed);
                }
                Err(_) => {
                    warn!("[{}] connect to {}:{} timed out", self.name, self.host, self.port);
                    let _ = self.events.send(UpstreamEvent::ConnectFailed);
                }
            }
            if !self.is_reconnecting() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.kick.notified() => {}
            }
            delay = (delay * 2).min(MAX_BACKOFF);
        }
        debug!("[{}] dial loop stopped", self.name);
    }

    async fn session(&self, stream: TcpStream) {
        tune_socket(&stream);
        let peer_ip = stream.peer_addr().ok().map(|a| a.ip().to_string());
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        *self.remote_ip.lock().unwrap() = peer_ip;
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(UpstreamEvent::Connected);

        self.read_loop(read_half).await;

        self.connected.store(false, Ordering::SeqCst);
        *self.writer.lock().await = None;
        self.pending.lock().unwrap().abandon_all();
        let _ = self.events.send(UpstreamEvent::Disconnected);
    }

    async fn read_loop(&self, read_half: OwnedReadHalf) {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::select! {
                r = reader.read_line(&mut line) => r,
                _ = self.kick.notified() => {
                    debug!("[{}] reconnect requested, dropping transport", self.name);
                    return;
                }
            };
            match read {
                Ok(0) => {
                    warn!("[{}] connection closed by {}:{}", self.name, self.host, self.port);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("[{}] read error: {}", self.name, e);
                    return;
                }
            }
            if line.len() > MAX_LINE_LENGTH {
                warn!("[{}] line exceeds {} bytes, closing", self.name, MAX_LINE_LENGTH);
                return;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            // Any inbound traffic counts as upstream liveness.
            self.activity.notify_one();
            if self.debug_wire {
                debug!("[{}] > {}", self.name, trimmed);
            }
            match codec::parse_line(trimmed) {
                Ok(Incoming::Response { id, result, error }) => {
                    let known = self.pending.lock().unwrap().resolve(id, result.clone(), error);
                    if !known {
                        warn!("[{}] response for unknown request id {}, closing", self.name, id);
                        return;
                    }
                    // Ping replies carry fresh work in the result array.
                    if result.is_array() {
                        let _ = self.events.send(UpstreamEvent::Job(result));
                    }
                }
                Ok(Incoming::Notification { result }) => {
                    if result.is_array() {
                        let _ = self.events.send(UpstreamEvent::Job(result));
                    } else {
                        debug!("[{}] notification without job payload: {}", self.name, result);
                    }
                }
                Err(e) => {
                    warn!("[{}] cannot decode message: {}", self.name, e);
                    return;
                }
            }
        }
    }
}

fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(120));
    #[cfg(unix)]
    let keepalive = keepalive.with_interval(Duration::from_secs(1)).with_retries(5);
    let sock = SockRef::from(stream);
    // Keepalive knobs are best-effort; not every platform exposes them.
    let _ = sock.set_tcp_keepalive(&keepalive);
}
