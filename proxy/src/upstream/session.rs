//! Per-upstream session bring-up and the process-wide idle watchdog.
//!
//! Session flow on every connect:
//! 1. `eth_submitLogin [wallet, email]` with the proxy client name
//! 2. periodic `eth_getWork` pings (5 s primary, 30 s failover)
//! 3. job payloads (notifications and array-valued replies) go to the registry

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::jobs::{Job, JobRegistry};

use super::client::{UpstreamClient, UpstreamEvent};

const PING_INTERVAL_MAIN: Duration = Duration::from_secs(5);
const PING_INTERVAL_FAILOVER: Duration = Duration::from_secs(30);

/// No traffic from any upstream for this long means the monitoring
/// connections are stuck and the disconnected ones get a reconnect kick.
const IDLE_TIMEOUT: Duration = Duration::from_secs(180);

pub struct SessionController {
    client: Arc<UpstreamClient>,
    registry: Arc<JobRegistry>,
    wallet: String,
    email: String,
    debug_mode: bool,
}

impl SessionController {
    pub fn new(
        client: Arc<UpstreamClient>,
        registry: Arc<JobRegistry>,
        wallet: String,
        email: String,
        debug_mode: bool,
    ) -> Self {
        Self { client, registry, wallet, email, debug_mode }
    }

    /// Subscribe before the client starts dialing so the first `Connected`
    /// cannot be missed, then drive the session in a background task.
    pub fn spawn(self) {
        let events = self.client.subscribe();
        tokio::spawn(async move { self.run(events).await });
    }

    async fn run(self, mut events: tokio::sync::broadcast::Receiver<UpstreamEvent>) {
        loop {
            match events.recv().await {
                Ok(UpstreamEvent::Connected) => {
                    info!(
                        "Connected to Stratum pool at {}:{}",
                        self.client.host(),
                        self.client.port()
                    );
                    let client = Arc::clone(&self.client);
                    let wallet = self.wallet.clone();
                    let email = self.email.clone();
                    let debug_mode = self.debug_mode;
                    tokio::spawn(async move {
                        login_and_ping(client, wallet, email, debug_mode).await;
                    });
                }
                Ok(UpstreamEvent::Disconnected) => {
                    info!(
                        "Disconnected from Stratum pool at {}:{}",
                        self.client.host(),
                        self.client.port()
                    );
                }
                Ok(UpstreamEvent::ConnectFailed) => {
                    // The dial loop retries on its own.
                }
                Ok(UpstreamEvent::Job(result)) => match Job::from_notification(&result) {
                    Some(job) => self.registry.replace_job(job, &self.client),
                    None => warn!("[{}] unusable job payload: {}", self.client.name(), result),
                },
                Err(RecvError::Lagged(n)) => {
                    warn!("[{}] session controller lagged by {} events", self.client.name(), n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

async fn login_and_ping(client: Arc<UpstreamClient>, wallet: String, email: String, debug_mode: bool) {
    let suffix = if debug_mode { "_debug" } else { "" };
    let client_name = format!("Proxy_{}{}", crate::VERSION, suffix);
    match client.rpc("eth_submitLogin", json!([wallet, email]), &client_name).await {
        Ok(result) => debug!("[{}] login result: {}", client.name(), result),
        Err(e) => {
            warn!("[{}] login failed: {}", client.name(), e);
            return;
        }
    }

    let interval = if client.is_failover() { PING_INTERVAL_FAILOVER } else { PING_INTERVAL_MAIN };
    loop {
        if !client.is_reconnecting() {
            break;
        }
        // The reply doubles as a job refresh; the read loop routes it.
        if client.rpc("eth_getWork", json!([]), "").await.is_err() {
            break;
        }
        tokio::time::sleep(interval).await;
    }
}

/// One timer for the whole process: any inbound upstream line resets it.
/// Healthy means "at least one upstream produced traffic recently", so on
/// expiry only the currently-disconnected upstreams get a reconnect kick.
pub struct IdleWatchdog {
    activity: Arc<Notify>,
    clients: StdMutex<Vec<Arc<UpstreamClient>>>,
}

impl IdleWatchdog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { activity: Arc::new(Notify::new()), clients: StdMutex::new(Vec::new()) })
    }

    /// Handle handed to each client; poked on every inbound line.
    pub fn activity_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.activity)
    }

    pub fn register(&self, client: Arc<UpstreamClient>) {
        self.clients.lock().unwrap().push(client);
    }

    pub fn spawn(self: &Arc<Self>) {
        let watchdog = Arc::clone(self);
        tokio::spawn(async move { watchdog.run().await });
    }

    async fn run(self: Arc<Self>) {
        let mut deadline = Instant::now() + IDLE_TIMEOUT;
        loop {
            tokio::select! {
                _ = self.activity.notified() => {
                    deadline = Instant::now() + IDLE_TIMEOUT;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    error!("Connection to upstream pool timed out");
                    let clients: Vec<_> = self.clients.lock().unwrap().clone();
                    for client in clients {
                        if !client.is_connected() {
                            client.reconnect();
                        }
                    }
                    deadline = Instant::now() + IDLE_TIMEOUT;
                }
            }
        }
    }
}
