//! Broker configuration.

use std::str::FromStr;
use std::time::Duration;

/// Broker tuning knobs. Defaults mirror production settings; every field
/// can be overridden from the environment via [`BrokerConfig::from_env`].
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address the router socket binds, e.g. `0.0.0.0:6000`.
    pub bind_addr: String,
    /// Shared secret required from every peer, if set.
    pub secret: Option<String>,
    /// How often non-zero traffic counters are logged and reset.
    pub stats_interval: Duration,
    /// Sweep cadence: dead-peer checks, liveness probes, ephemeral GC.
    pub heartbeat: Duration,
    /// Silence threshold after which a peer is marked dead.
    pub dead_after: Duration,
    /// TTL applied to ephemeral topics that do not request their own.
    pub ephemeral_ttl: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:6000".to_string(),
            secret: None,
            stats_interval: Duration::from_secs(60),
            heartbeat: Duration::from_secs(1),
            dead_after: Duration::from_secs(5),
            ephemeral_ttl: Duration::from_secs(300),
        }
    }
}

impl BrokerConfig {
    /// Builds a config from the environment:
    /// `HUBMESH_BIND`, `HUBMESH_SECRET`, `HUBMESH_STATS_SECS`,
    /// `HUBMESH_BEAT_MS`, `HUBMESH_DEAD_MS`, `HUBMESH_EPHEMERAL_TTL_SECS`.
    /// Unset or unparseable variables keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("HUBMESH_BIND").unwrap_or(defaults.bind_addr),
            secret: std::env::var("HUBMESH_SECRET").ok().filter(|s| !s.is_empty()),
            stats_interval: env_parse("HUBMESH_STATS_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stats_interval),
            heartbeat: env_parse("HUBMESH_BEAT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.heartbeat),
            dead_after: env_parse("HUBMESH_DEAD_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.dead_after),
            ephemeral_ttl: env_parse("HUBMESH_EPHEMERAL_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.ephemeral_ttl),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
