//! Configuration for the controller daemon.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rekon_id::NodeName;
use rekon_reconcile::{
    DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_RECONCILE_INTERVAL, DEFAULT_RELIST_INTERVAL,
};

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory for local state.
    pub data_dir: PathBuf,

    /// SQLite desired state store shared with `rekonctl`.
    pub store_path: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Interval of the periodic safety-net pass.
    pub reconcile_interval: Duration,

    /// Interval between full relists of the runtime.
    pub relist_interval: Duration,

    pub backoff_base: Duration,
    pub backoff_max: Duration,

    /// Node inventory with device capacity.
    pub nodes: Vec<(NodeName, u32)>,

    /// When set, host paths resolve under `<node_root>/<node>/`.
    pub node_root: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = var("REKON_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/rekon"));

        let store_path = var("REKON_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("desired.db"));

        let log_level = var("REKON_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let reconcile_interval = match var("REKON_RECONCILE_INTERVAL_SECS") {
            Some(v) => Duration::from_secs(parse_u64("REKON_RECONCILE_INTERVAL_SECS", &v)?),
            None => DEFAULT_RECONCILE_INTERVAL,
        };

        let relist_interval = match var("REKON_RELIST_INTERVAL_SECS") {
            Some(v) => Duration::from_secs(parse_u64("REKON_RELIST_INTERVAL_SECS", &v)?),
            None => DEFAULT_RELIST_INTERVAL,
        };

        let backoff_base = match var("REKON_BACKOFF_BASE_MS") {
            Some(v) => Duration::from_millis(parse_u64("REKON_BACKOFF_BASE_MS", &v)?),
            None => DEFAULT_BACKOFF_BASE,
        };

        let backoff_max = match var("REKON_BACKOFF_MAX_SECS") {
            Some(v) => Duration::from_secs(parse_u64("REKON_BACKOFF_MAX_SECS", &v)?),
            None => DEFAULT_BACKOFF_MAX,
        };

        if reconcile_interval.is_zero() || relist_interval.is_zero() {
            return Err(anyhow!("reconcile and relist intervals must be positive"));
        }

        let nodes = match var("REKON_NODES") {
            Some(v) => parse_nodes(&v).context("invalid REKON_NODES")?,
            None => vec![(NodeName::parse("local").context("default node name")?, 1)],
        };

        let node_root = var("REKON_NODE_ROOT").map(PathBuf::from);

        Ok(Self {
            data_dir,
            store_path,
            log_level,
            reconcile_interval,
            relist_interval,
            backoff_base,
            backoff_max,
            nodes,
            node_root,
        })
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a non-negative integer, got {value:?}"))
}

/// Parse a node inventory of the form `node-a=1,node-b=2`.
pub fn parse_nodes(value: &str) -> Result<Vec<(NodeName, u32)>> {
    let mut nodes = Vec::new();

    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, capacity) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("expected NAME=DEVICES, got {entry:?}"))?;

        let name = NodeName::parse(name.trim())?;
        let capacity = capacity
            .trim()
            .parse()
            .with_context(|| format!("invalid device count for node {name}"))?;

        if nodes.iter().any(|(n, _)| n == &name) {
            return Err(anyhow!("node {name} listed twice"));
        }
        nodes.push((name, capacity));
    }

    if nodes.is_empty() {
        return Err(anyhow!("at least one node is required"));
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.store_path, PathBuf::from("/var/lib/rekon/desired.db"));
        assert_eq!(config.reconcile_interval, DEFAULT_RECONCILE_INTERVAL);
        assert_eq!(config.nodes.len(), 1);
        assert!(config.node_root.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("REKON_DATA_DIR", "/tmp/rekon"),
            ("REKON_RELIST_INTERVAL_SECS", "3"),
            ("REKON_BACKOFF_BASE_MS", "250"),
            ("REKON_NODES", "gpu-0=1, gpu-1=1,gpu-2=2"),
        ]))
        .unwrap();

        assert_eq!(config.store_path, PathBuf::from("/tmp/rekon/desired.db"));
        assert_eq!(config.relist_interval, Duration::from_secs(3));
        assert_eq!(config.backoff_base, Duration::from_millis(250));
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.nodes[2].1, 2);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_lookup(lookup(&[("REKON_RECONCILE_INTERVAL_SECS", "soon")])).is_err());
        assert!(Config::from_lookup(lookup(&[("REKON_RELIST_INTERVAL_SECS", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("REKON_NODES", "gpu-0")])).is_err());
    }

    #[test]
    fn test_parse_nodes() {
        assert!(parse_nodes("a=1,a=2").is_err());
        assert!(parse_nodes("Bad_Name=1").is_err());
        assert!(parse_nodes("a=-1").is_err());
        assert!(parse_nodes("").is_err());
        assert_eq!(parse_nodes("a=0").unwrap()[0].1, 0);
    }
}
