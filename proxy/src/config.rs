//! Proxy configuration.
//!
//! Loaded from a flat `KEY = VALUE` file (`eth-proxy.conf` by default).
//! Values are typed by their literal form: `True`/`False` are booleans,
//! quoted values are strings, everything else must parse as an integer.
//! `#` starts a comment.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::warn;

/// One configured upstream pool endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for PoolAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Verbose wire framing log; also forces the DEBUG log level.
    pub debug: bool,
    pub log_to_file: bool,
    pub log_level: String,

    /// Miner-facing bind address.
    pub host: String,
    pub port: u16,

    /// Payout address, 40 or 42 characters.
    pub wallet: String,
    /// URL-path worker attribution.
    pub enable_worker_id: bool,

    pub monitoring: bool,
    pub monitoring_email: String,

    pub coin: String,

    pub pool: PoolAddr,
    pub pool_failover_enable: bool,
    pub failover1: PoolAddr,
    pub failover2: PoolAddr,
    pub failover3: PoolAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            log_to_file: false,
            log_level: "INFO".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            wallet: "XXXXXX".to_string(),
            enable_worker_id: false,
            monitoring: false,
            monitoring_email: "mail@example.com".to_string(),
            coin: "ETH".to_string(),
            pool: PoolAddr { host: "eth-eu.dwarfpool.com".to_string(), port: 8008 },
            pool_failover_enable: false,
            failover1: PoolAddr { host: "eth-ru.dwarfpool.com".to_string(), port: 8008 },
            failover2: PoolAddr { host: "eth-us.dwarfpool.com".to_string(), port: 8008 },
            failover3: PoolAddr { host: "eth-hk.dwarfpool.com".to_string(), port: 8008 },
        }
    }
}

/// A raw configuration value, typed by its literal form.
#[derive(Debug, Clone, PartialEq)]
enum ConfValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl ConfValue {
    fn as_bool(&self, key: &str) -> Result<bool> {
        match self {
            ConfValue::Bool(b) => Ok(*b),
            other => bail!("{} expects True or False, got {:?}", key, other),
        }
    }

    fn as_int(&self, key: &str) -> Result<i64> {
        match self {
            ConfValue::Int(i) => Ok(*i),
            other => bail!("{} expects an integer, got {:?}", key, other),
        }
    }

    fn as_port(&self, key: &str) -> Result<u16> {
        let i = self.as_int(key)?;
        u16::try_from(i).with_context(|| format!("{} is not a valid port: {}", key, i))
    }

    fn as_str(&self, key: &str) -> Result<String> {
        match self {
            ConfValue::Str(s) => Ok(s.clone()),
            other => bail!("{} expects a quoted string, got {:?}", key, other),
        }
    }
}

fn parse_value(raw: &str) -> Result<ConfValue> {
    match raw {
        "True" => return Ok(ConfValue::Bool(true)),
        "False" => return Ok(ConfValue::Bool(false)),
        _ => {}
    }
    if raw.len() >= 2 {
        let bytes = raw.as_bytes();
        let quote = bytes[0];
        if (quote == b'"' || quote == b'\'') && bytes[bytes.len() - 1] == quote {
            return Ok(ConfValue::Str(raw[1..raw.len() - 1].to_string()));
        }
    }
    raw.parse::<i64>()
        .map(ConfValue::Int)
        .with_context(|| format!("cannot parse value '{}'", raw))
}

/// Parse the flat `KEY = VALUE` format into a raw option map.
fn parse_conf(text: &str) -> Result<HashMap<String, ConfValue>> {
    let mut map = HashMap::new();
    for (lineno, raw_line) in text.lines().enumerate() {
        let line = match raw_line.find('#') {
            Some(pos) => &raw_line[..pos],
            None => raw_line,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .with_context(|| format!("line {}: expected KEY = VALUE", lineno + 1))?;
        let key = key.trim().to_string();
        let value = parse_value(value.trim())
            .with_context(|| format!("line {}: bad value for {}", lineno + 1, key))?;
        map.insert(key, value);
    }
    Ok(map)
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut cfg = Self::default();
        let map = parse_conf(text)?;
        for (key, value) in &map {
            match key.as_str() {
                "DEBUG" => cfg.debug = value.as_bool(key)?,
                "LOG_TO_FILE" => cfg.log_to_file = value.as_bool(key)?,
                "LOGLEVEL" => cfg.log_level = value.as_str(key)?,
                "HOST" => cfg.host = value.as_str(key)?,
                "PORT" => cfg.port = value.as_port(key)?,
                "WALLET" => cfg.wallet = value.as_str(key)?,
                "ENABLE_WORKER_ID" => cfg.enable_worker_id = value.as_bool(key)?,
                "MONITORING" => cfg.monitoring = value.as_bool(key)?,
                "MONITORING_EMAIL" => cfg.monitoring_email = value.as_str(key)?,
                "COIN" => cfg.coin = value.as_str(key)?,
                "POOL_HOST" => cfg.pool.host = value.as_str(key)?,
                "POOL_PORT" => cfg.pool.port = value.as_port(key)?,
                "POOL_FAILOVER_ENABLE" => cfg.pool_failover_enable = value.as_bool(key)?,
                "POOL_HOST_FAILOVER1" => cfg.failover1.host = value.as_str(key)?,
                "POOL_PORT_FAILOVER1" => cfg.failover1.port = value.as_port(key)?,
                "POOL_HOST_FAILOVER2" => cfg.failover2.host = value.as_str(key)?,
                "POOL_PORT_FAILOVER2" => cfg.failover2.port = value.as_port(key)?,
                "POOL_HOST_FAILOVER3" => cfg.failover3.host = value.as_str(key)?,
                "POOL_PORT_FAILOVER3" => cfg.failover3.port = value.as_port(key)?,
                other => warn!("Ignoring unknown config option {}", other),
            }
        }
        Ok(cfg)
    }

    /// Wallet addresses are either bare (40 chars) or 0x-prefixed (42 chars).
    pub fn validate(&self) -> Result<()> {
        if self.wallet.len() != 40 && self.wallet.len() != 42 {
            bail!("Wrong WALLET!");
        }
        Ok(())
    }

    /// Second parameter of `eth_submitLogin`: the monitoring email, or the
    /// empty string unless monitoring is enabled and an address is set.
    pub fn custom_email(&self) -> String {
        if self.monitoring && !self.monitoring_email.is_empty() {
            self.monitoring_email.clone()
        } else {
            String::new()
        }
    }

    /// Seconds a job may be re-served before miners are told to restart.
    pub fn coin_timeout(&self) -> i64 {
        if self.coin == "ETH" {
            360
        } else {
            900
        }
    }

    /// Failover pools in declared priority order, empty unless enabled.
    pub fn failovers(&self) -> Vec<PoolAddr> {
        if self.pool_failover_enable {
            vec![self.failover1.clone(), self.failover2.clone(), self.failover3.clone()]
        } else {
            Vec::new()
        }
    }

    /// Effective tracing level; DEBUG=True wins over LOGLEVEL.
    pub fn tracing_level(&self) -> tracing::Level {
        if self.debug {
            return tracing::Level::DEBUG;
        }
        match self.log_level.as_str() {
            "DEBUG" => tracing::Level::DEBUG,
            "WARNING" => tracing::Level::WARN,
            // CRITICAL has no tracing counterpart; ERROR is the closest.
            "ERROR" | "CRITICAL" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}
