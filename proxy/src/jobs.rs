//! Mining job cache and upstream arbitration.
//!
//! The registry holds the one job miners poll for, decides which upstream's
//! jobs are live (first connected pool in declared priority order), and
//! routes share submissions back up the same way.

use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::upstream::UpstreamClient;

/// One mining job as broadcast by the pool: an opaque ordered tuple of hex
/// strings. Element 0 (the header hash) is the job identity; element 1 (the
/// seed hash) names the DAG epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    params: Vec<String>,
}

impl Job {
    /// Build a job from the `result` array of a pool broadcast. Anything
    /// that is not a non-empty array of strings is rejected.
    pub fn from_notification(result: &Value) -> Option<Self> {
        let arr = result.as_array()?;
        if arr.is_empty() {
            return None;
        }
        let params = arr
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()?;
        Some(Self { params })
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn header_hash(&self) -> &str {
        &self.params[0]
    }

    /// 16 hex chars of the seed hash (without the `0x` prefix), the
    /// human-facing name of the active DAG epoch.
    pub fn dag_id(&self) -> &str {
        self.params
            .get(1)
            .map(|seed| seed.get(2..18).unwrap_or(seed.as_str()))
            .unwrap_or("")
    }
}

pub struct JobRegistry {
    /// Primary first, then failovers in declared priority order.
    upstreams: Vec<Arc<UpstreamClient>>,
    current: RwLock<Option<Job>>,
    /// Generation counter bumped on every accepted job change.
    change_tx: watch::Sender<u64>,
    coin_timeout: i64,
}

impl JobRegistry {
    pub fn new(upstreams: Vec<Arc<UpstreamClient>>, coin_timeout: i64) -> Arc<Self> {
        let (change_tx, _) = watch::channel(0);
        Arc::new(Self { upstreams, current: RwLock::new(None), change_tx, coin_timeout })
    }

    pub fn upstreams(&self) -> &[Arc<UpstreamClient>] {
        &self.upstreams
    }

    /// Seconds a job may be re-served before miners are told to restart.
    pub fn coin_timeout(&self) -> i64 {
        self.coin_timeout
    }

    /// Snapshot of the cached job.
    pub fn current_job(&self) -> Option<Job> {
        self.current.read().unwrap().clone()
    }

    /// Observe job changes; the value is a generation counter.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.change_tx.subscribe()
    }

    /// The highest-priority currently-connected pool.
    fn live_upstream(&self) -> Option<&Arc<UpstreamClient>> {
        self.upstreams.iter().find(|u| u.is_connected())
    }

    /// Accept `new_job` iff it came from the live upstream. Duplicate header
    /// hashes are dropped without firing the change signal.
    pub fn replace_job(&self, new_job: Job, source: &Arc<UpstreamClient>) {
        let tag = if source.is_failover() { "FAILOVER" } else { "MAIN" };
        let is_live = self.live_upstream().map(|l| Arc::ptr_eq(l, source)).unwrap_or(false);
        if !is_live {
            debug!("{} NEW_JOB NOT_USED {:?}", tag, new_job.params());
            return;
        }
        {
            let mut current = self.current.write().unwrap();
            if current.as_ref().map(|j| j.header_hash() == new_job.header_hash()).unwrap_or(false) {
                // Same work unit re-broadcast; miners keep what they have.
                return;
            }
            info!("{} NEW_JOB", tag);
            debug!("{} NEW_JOB {:?}", tag, new_job.params());
            *current = Some(new_job);
        }
        // Fired strictly after the cached job is visible to readers.
        self.change_tx.send_modify(|generation| *generation += 1);
    }

    /// Route a share or hashrate report to the live upstream. Dropped when
    /// every pool is down; the miner already got its optimistic ack and will
    /// resubmit on the next share.
    pub fn submit(&self, method: &str, params: Value, worker: &str) {
        let Some(upstream) = self.live_upstream().cloned() else {
            warn!("NO_SUBMIT_ALL_POOLS_DOWN {} by {}", method, worker);
            return;
        };
        let tag = if upstream.is_failover() { "FAILOVER" } else { "MAIN" };
        if method == "eth_submitWork" {
            let header = params.get(1).and_then(Value::as_str).unwrap_or("");
            info!("{} eth_submitWork {} by {}", tag, header, worker);
        }
        debug!("{} {} by {} {}", tag, method, worker, params);
        let method = method.to_string();
        let worker = worker.to_string();
        tokio::spawn(async move {
            // Accept/reject is logged by the codec when the reply correlates.
            let _ = upstream.rpc(&method, params, &worker).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Notify;

    fn test_client(name: &str, failover: bool) -> Arc<UpstreamClient> {
        UpstreamClient::new(name, "127.0.0.1", 3333, failover, false, Arc::new(Notify::new()))
    }

    fn job(header: &str) -> Job {
        Job::from_notification(&json!([header, "0xseed", "0xtarget"])).unwrap()
    }

    #[test]
    fn job_parses_only_string_arrays() {
        assert!(Job::from_notification(&json!(["0xaaa", "0xbbb", "0xccc"])).is_some());
        assert!(Job::from_notification(&json!([])).is_none());
        assert!(Job::from_notification(&json!(true)).is_none());
        assert!(Job::from_notification(&json!([1, 2, 3])).is_none());
        assert!(Job::from_notification(&json!(null)).is_none());
    }

    #[test]
    fn dag_id_is_seed_hash_without_prefix() {
        let j = Job::from_notification(&json!([
            "0xdeadbeef",
            "0x1234567890abcdef1234567890abcdef",
            "0xtarget"
        ]))
        .unwrap();
        assert_eq!(j.dag_id(), "1234567890abcdef");
    }

    #[test]
    fn duplicate_header_hash_fires_change_signal_once() {
        let main = test_client("main", false);
        main.force_connected(true);
        let registry = JobRegistry::new(vec![main.clone()], 360);
        let changes = registry.subscribe_changes();

        registry.replace_job(job("0xaaa"), &main);
        assert_eq!(*changes.borrow(), 1);
        registry.replace_job(job("0xaaa"), &main);
        assert_eq!(*changes.borrow(), 1);
        registry.replace_job(job("0xbbb"), &main);
        assert_eq!(*changes.borrow(), 2);
    }

    #[test]
    fn failover_job_never_replaces_a_live_primary() {
        let main = test_client("main", false);
        let failover = test_client("failover1", true);
        main.force_connected(true);
        failover.force_connected(true);
        let registry = JobRegistry::new(vec![main.clone(), failover.clone()], 360);

        registry.replace_job(job("0xfff"), &failover);
        assert!(registry.current_job().is_none());

        registry.replace_job(job("0xaaa"), &main);
        assert_eq!(registry.current_job().unwrap().header_hash(), "0xaaa");

        // arrival order does not matter while the primary is connected
        registry.replace_job(job("0xeee"), &failover);
        assert_eq!(registry.current_job().unwrap().header_hash(), "0xaaa");
    }

    #[test]
    fn failover_takes_over_when_primary_drops() {
        let main = test_client("main", false);
        let failover = test_client("failover1", true);
        main.force_connected(true);
        failover.force_connected(true);
        let registry = JobRegistry::new(vec![main.clone(), failover.clone()], 360);

        registry.replace_job(job("0xaaa"), &main);
        main.force_connected(false);

        registry.replace_job(job("0xfff"), &failover);
        assert_eq!(registry.current_job().unwrap().header_hash(), "0xfff");

        // primary reconnects with fresh work and wins back immediately
        main.force_connected(true);
        registry.replace_job(job("0xbbb"), &main);
        assert_eq!(registry.current_job().unwrap().header_hash(), "0xbbb");
    }

    #[tokio::test]
    async fn submit_with_all_pools_down_is_dropped() {
        let main = test_client("main", false);
        let registry = JobRegistry::new(vec![main.clone()], 360);
        // nothing to assert beyond "does not panic / does not route"
        registry.submit("eth_submitWork", json!(["0x1", "0x2", "0x3"]), "rig1");
    }
}
