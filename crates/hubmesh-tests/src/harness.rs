//! Shared setup for end-to-end tests: one broker per cluster, bound to an
//! ephemeral port, with timers tightened so eviction and GC are observable
//! within a test's lifetime.

use std::sync::Arc;
use std::time::Duration;

use hubmesh_broker::{Broker, BrokerConfig, RunningBroker};
use hubmesh_node::{Node, NodeConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a fmt subscriber honoring `RUST_LOG`. Safe to call from every
/// test; only the first call in the process wins.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

/// Broker config with sub-second sweep and eviction timers.
pub fn fast_broker_config() -> BrokerConfig {
    BrokerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        secret: None,
        stats_interval: Duration::from_secs(3600),
        heartbeat: Duration::from_millis(50),
        dead_after: Duration::from_millis(400),
        ephemeral_ttl: Duration::from_secs(300),
    }
}

/// Node config matched to [`fast_broker_config`]: probes fast enough to
/// stay alive under the broker's 400ms eviction threshold.
pub fn fast_node_config(addr: impl Into<String>) -> NodeConfig {
    NodeConfig {
        addr: addr.into(),
        secret: None,
        heartbeat: Duration::from_millis(50),
        dead_after: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(5),
        redial_delay: Duration::from_millis(100),
        debug: false,
    }
}

/// One running broker plus helpers for attaching nodes to it.
pub struct TestCluster {
    /// The broker instance, kept so tests can read its seed.
    pub broker: Arc<Broker>,
    /// The bound listener and periodic tasks.
    pub running: RunningBroker,
}

impl TestCluster {
    /// Starts a broker with [`fast_broker_config`].
    pub async fn start() -> Self {
        Self::start_with(fast_broker_config()).await
    }

    /// Starts a broker with the given config.
    pub async fn start_with(config: BrokerConfig) -> Self {
        init_logging();
        let broker = Arc::new(Broker::new(config));
        let running = broker.listen().await.expect("broker failed to bind");
        TestCluster { broker, running }
    }

    /// The broker's bound address.
    pub fn addr(&self) -> String {
        self.running.local_addr().to_string()
    }

    /// Connects a node to this cluster's broker with fast timers.
    pub async fn node(&self) -> Node {
        Node::connect(fast_node_config(self.addr()))
            .await
            .expect("node failed to connect")
    }
}

/// Polls `check` every 20ms until it holds or `deadline` elapses. Returns
/// the final outcome.
pub async fn wait_for(deadline: Duration, check: impl Fn() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
