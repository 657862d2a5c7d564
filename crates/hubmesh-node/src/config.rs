//! Node configuration.

use std::str::FromStr;
use std::time::Duration;

/// Node tuning knobs. Defaults mirror the broker's: the node probes every
/// heartbeat and declares the broker down after `dead_after` of silence.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Broker address, e.g. `127.0.0.1:6000`.
    pub addr: String,
    /// Shared secret presented on every (re)connect.
    pub secret: Option<String>,
    /// Probe cadence and liveness check interval.
    pub heartbeat: Duration,
    /// Broker silence threshold before `on_disconnect` fires.
    pub dead_after: Duration,
    /// Dial timeout for the underlying client transport.
    pub connect_timeout: Duration,
    /// Redial delay after a dropped link.
    pub redial_delay: Duration,
    /// Log heartbeat bookkeeping at trace level.
    pub debug: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6000".to_string(),
            secret: None,
            heartbeat: Duration::from_secs(1),
            dead_after: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            redial_delay: Duration::from_millis(500),
            debug: false,
        }
    }
}

impl NodeConfig {
    /// Convenience constructor for the common case.
    pub fn for_addr(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    /// Builds a config from the environment: `HUBMESH_ADDR`,
    /// `HUBMESH_SECRET`, `HUBMESH_NODE_BEAT_MS`, `HUBMESH_NODE_DEAD_MS`,
    /// `HUBMESH_DEBUG_NODE`. Unset variables keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            addr: std::env::var("HUBMESH_ADDR").unwrap_or(defaults.addr),
            secret: std::env::var("HUBMESH_SECRET").ok().filter(|s| !s.is_empty()),
            heartbeat: env_parse("HUBMESH_NODE_BEAT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.heartbeat),
            dead_after: env_parse("HUBMESH_NODE_DEAD_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.dead_after),
            connect_timeout: defaults.connect_timeout,
            redial_delay: defaults.redial_delay,
            debug: env_parse("HUBMESH_DEBUG_NODE").unwrap_or(defaults.debug),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
