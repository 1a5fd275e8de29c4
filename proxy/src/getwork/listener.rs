//! HTTP getwork endpoint for miners.
//!
//! Serves `eth_getWork` from the registry cache, routes `eth_submitWork` /
//! `eth_submitHashrate` to the live upstream, and attributes submissions to
//! a worker name taken from the URL path (or synthesized from the miner's
//! IPv4 address). Every reply is a JSON object plus a trailing newline,
//! always HTTP 200; application failures travel in the `error` member.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tracing::{info, warn};

use crate::jobs::JobRegistry;

use super::status::status_page;

const WAITING_FOR_JOB: &str = "Proxy is waiting for a job...";
const JOB_TIMEOUT: &str = "Job timeout. Proxy is waiting for an updated job...";

/// At most one hashrate log line (and upstream report) per worker per window.
const HASHRATE_LOG_WINDOW: i64 = 60;

/// Worker names from the URL path are clipped to this many characters.
const WORKER_NAME_MAX: usize = 14;

/// Staleness record for the one job the endpoint keeps re-serving.
struct JobAge {
    header_hash: String,
    first_seen: i64,
}

pub struct GetworkService {
    registry: Arc<JobRegistry>,
    enable_worker_id: bool,
    job_age: Mutex<Option<JobAge>>,
    /// worker name -> epoch seconds of the last admitted hashrate log.
    hashrate_seen: Mutex<HashMap<String, i64>>,
}

impl GetworkService {
    pub fn new(registry: Arc<JobRegistry>, enable_worker_id: bool) -> Arc<Self> {
        Arc::new(Self {
            registry,
            enable_worker_id,
            job_age: Mutex::new(None),
            hashrate_seen: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }
}

pub fn router(service: Arc<GetworkService>) -> Router {
    Router::new()
        .route("/", get(status_page).post(handle_rpc))
        .route("/*worker", get(status_page).post(handle_rpc))
        .with_state(service)
}

/// Bind the miner-facing listener with the keepalive tuning miners rely on
/// to notice a dead proxy quickly (idle 60 s, probe every 1 s, 5 probes).
pub fn bind(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("cannot create listener socket")?;
    socket.set_reuse_address(true)?;
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
    #[cfg(unix)]
    let keepalive = keepalive.with_interval(Duration::from_secs(1)).with_retries(5);
    // Not every platform exposes the probe knobs; keepalive itself is enough.
    let _ = socket.set_tcp_keepalive(&keepalive);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into()).with_context(|| format!("cannot bind {}", addr))?;
    socket.listen(1024)?;
    tokio::net::TcpListener::from_std(socket.into()).context("cannot register listener")
}

#[derive(Serialize)]
struct RpcResult {
    id: Value,
    jsonrpc: &'static str,
    result: Value,
}

#[derive(Serialize)]
struct RpcError {
    id: Value,
    jsonrpc: &'static str,
    result: bool,
    error: String,
}

fn json_body(value: impl Serialize) -> Response {
    let mut body = serde_json::to_string(&value).expect("reply serialization cannot fail");
    body.push('\n');
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn json_response(id: Value, result: Value) -> Response {
    json_body(RpcResult { id, jsonrpc: "2.0", result })
}

fn json_error(id: Value, message: &str) -> Response {
    json_body(RpcError { id, jsonrpc: "2.0", result: false, error: message.to_string() })
}

async fn handle_rpc(
    State(service): State<Arc<GetworkService>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
    body: String,
) -> Response {
    let Ok(data) = serde_json::from_str::<Value>(&body) else {
        return json_error(Value::from(0), "Cannot decode request body");
    };
    let msg_id = data.get("id").cloned().unwrap_or_else(|| Value::from(0));

    let Some(job) = service.registry.current_job() else {
        warn!("Proxy is waiting for a job...");
        return json_error(msg_id, WAITING_FOR_JOB);
    };

    let Some(method) = data.get("method").and_then(Value::as_str) else {
        return json_error(msg_id, "Need methods");
    };

    match method {
        "eth_getWork" => {
            let now = Utc::now().timestamp();
            let stale = {
                let mut age = service.job_age.lock().unwrap();
                job_is_stale(&mut age, job.header_hash(), now, service.registry.coin_timeout())
            };
            if stale {
                warn!("Job is expired, restart the miner! Proxy is waiting for an updated job from the pool");
                return json_error(msg_id, JOB_TIMEOUT);
            }
            json_response(msg_id, json!(job.params()))
        }
        "eth_submitWork" | "eth_submitHashrate" => {
            let worker = derive_worker_name(uri.path(), peer.ip(), service.enable_worker_id);
            let params = data.get("params").cloned().unwrap_or_else(|| json!([]));
            if method == "eth_submitWork" {
                service.registry.submit(method, params, &worker);
            } else {
                let now = Utc::now().timestamp();
                let admitted = {
                    let mut seen = service.hashrate_seen.lock().unwrap();
                    admit_hashrate_log(&mut seen, &worker, now)
                };
                if admitted {
                    info!("Hashrate: {:.2} MH/s by {}", hashrate_mhs(&params), worker);
                    service.registry.submit(method, params, &worker);
                }
            }
            json_response(msg_id, Value::Bool(true))
        }
        other => json_error(msg_id, &format!("Unsupported method '{}'", other)),
    }
}

/// Staleness rule for the job-age cache: a header hash served for longer
/// than `timeout` seconds is stale, and its record is deliberately left
/// untouched so the miner stays stuck until the registry itself updates.
fn job_is_stale(age: &mut Option<JobAge>, header_hash: &str, now: i64, timeout: i64) -> bool {
    match age {
        Some(record) if record.header_hash == header_hash => now - record.first_seen >= timeout,
        _ => {
            *age = Some(JobAge { header_hash: header_hash.to_string(), first_seen: now });
            false
        }
    }
}

fn admit_hashrate_log(seen: &mut HashMap<String, i64>, worker: &str, now: i64) -> bool {
    match seen.get(worker) {
        Some(last) if now - last < HASHRATE_LOG_WINDOW => false,
        _ => {
            seen.insert(worker.to_string(), now);
            true
        }
    }
}

fn hashrate_mhs(params: &Value) -> f64 {
    params
        .get(0)
        .and_then(Value::as_str)
        .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
        .map(|rate| rate as f64 / 1e6)
        .unwrap_or(0.0)
}

/// Worker identity for a submission: the first path segment (clipped to 14
/// characters), or the miner's IPv4 address encoded as a decimal number when
/// the path carries no name. Empty when worker-id mode is off.
fn derive_worker_name(path: &str, peer: IpAddr, enabled: bool) -> String {
    if !enabled {
        return String::new();
    }
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let clipped: String = trimmed.chars().take(WORKER_NAME_MAX).collect();
    let name = clipped.split('/').next().unwrap_or("");
    if !name.is_empty() {
        return name.to_string();
    }
    match peer {
        IpAddr::V4(v4) => u32::from(v4).to_string(),
        IpAddr::V6(v6) => v6.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn worker_name_from_url_path() {
        assert_eq!(derive_worker_name("/rig1", v4(1, 2, 3, 4), true), "rig1");
        assert_eq!(derive_worker_name("/rig1/extra", v4(1, 2, 3, 4), true), "rig1");
        // clipped to 14 characters before the split
        assert_eq!(
            derive_worker_name("/abcdefghijklmnopqrstuvwxyz", v4(1, 2, 3, 4), true),
            "abcdefghijklmn"
        );
    }

    #[test]
    fn worker_name_from_ip_when_path_is_empty() {
        assert_eq!(derive_worker_name("/", v4(1, 2, 3, 4), true), "16909060");
        assert_eq!(derive_worker_name("/", v4(10, 0, 0, 5), true), "167772165");
    }

    #[test]
    fn worker_name_empty_when_mode_is_off() {
        assert_eq!(derive_worker_name("/rig1", v4(1, 2, 3, 4), false), "");
        assert_eq!(derive_worker_name("/", v4(1, 2, 3, 4), false), "");
    }

    #[test]
    fn job_age_marks_stale_after_timeout_without_refreshing() {
        let mut age = None;
        assert!(!job_is_stale(&mut age, "0xaaa", 1_000, 360));
        assert!(!job_is_stale(&mut age, "0xaaa", 1_359, 360));
        // 361 s after first sight: stale, record untouched
        assert!(job_is_stale(&mut age, "0xaaa", 1_361, 360));
        assert_eq!(age.as_ref().unwrap().first_seen, 1_000);
        assert!(job_is_stale(&mut age, "0xaaa", 1_400, 360));
        // a different header resets the record
        assert!(!job_is_stale(&mut age, "0xbbb", 1_500, 360));
        assert_eq!(age.as_ref().unwrap().first_seen, 1_500);
    }

    #[test]
    fn hashrate_log_admitted_once_per_window_per_worker() {
        let mut seen = HashMap::new();
        assert!(admit_hashrate_log(&mut seen, "rig1", 100));
        assert!(!admit_hashrate_log(&mut seen, "rig1", 130));
        assert!(!admit_hashrate_log(&mut seen, "rig1", 159));
        assert!(admit_hashrate_log(&mut seen, "rig1", 160));
        // workers are rate-limited independently
        assert!(admit_hashrate_log(&mut seen, "rig2", 130));
    }

    #[test]
    fn hashrate_parses_hex_to_mhs() {
        assert_eq!(hashrate_mhs(&json!(["0x1E84800"])), 32.0);
        assert_eq!(hashrate_mhs(&json!(["garbage"])), 0.0);
        assert_eq!(hashrate_mhs(&json!([])), 0.0);
    }
}
