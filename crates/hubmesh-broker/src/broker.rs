//! The routing core.
//!
//! All routing tables live behind a single mutex, never held across an
//! await: inbound frames mutate state and enqueue deliveries without
//! blocking, which is the multi-threaded equivalent of the single event
//! loop the protocol assumes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hubmesh_transport::topic;
use hubmesh_transport::{Cid, Frame, FrameHandler, Mid, Result, Server, ServerConfig, ServerHandle};

use crate::config::BrokerConfig;
use crate::select::{SelectStrategy, UniformRandom};
use crate::stats::TrafficStats;

/// In-flight call record: lets the broker notify the caller if the target
/// dies before replying.
#[derive(Debug, Clone)]
struct WatchEntry {
    caller: Cid,
    topic: String,
    target: Cid,
    mid: Mid,
}

#[derive(Debug, Clone, Copy)]
struct EphemeralTimer {
    last: Instant,
    ttl: Duration,
}

#[derive(Default)]
struct RouterState {
    /// cid → last observed activity.
    clients: HashMap<Cid, Instant>,
    /// topic → subscribed cids.
    topics: HashMap<String, Vec<Cid>>,
    /// topic → cids serving calls.
    direct: HashMap<String, Vec<Cid>>,
    /// call target → pending call records.
    watch: HashMap<Cid, Vec<WatchEntry>>,
    /// ephemeral topic → inactivity timer.
    ttimer: HashMap<String, EphemeralTimer>,
    /// cached subscription keys ending in `/*`.
    wildcards: Vec<String>,
    stats: TrafficStats,
}

impl RouterState {
    fn rebuild_wildcards(&mut self) {
        self.wildcards = self
            .topics
            .keys()
            .filter(|key| topic::is_wildcard(key))
            .cloned()
            .collect();
    }

    /// Recipient set for one publication: exact subscribers, matching
    /// wildcard subscribers, and catch-all subscribers, each cid at most
    /// once regardless of how many patterns it matches.
    fn recipients_for(&self, published: &str) -> Vec<Cid> {
        let mut out: Vec<Cid> = Vec::new();
        let mut extend = |cids: Option<&Vec<Cid>>| {
            for cid in cids.into_iter().flatten() {
                if !out.contains(cid) {
                    out.push(cid.clone());
                }
            }
        };
        extend(self.topics.get(published));
        for key in &self.wildcards {
            if topic::wildcard_matches(key, published) {
                extend(self.topics.get(key));
            }
        }
        extend(self.topics.get(topic::CATCH_ALL));
        out
    }

    /// Arms or refreshes an ephemeral topic's timer. `requested` is the
    /// TTL from a subscription (seconds); otherwise the previous TTL, or
    /// the default, is kept.
    fn arm_ephemeral(&mut self, name: &str, requested: Option<u64>, default_ttl: Duration, now: Instant) {
        if !topic::is_ephemeral(name) {
            return;
        }
        let previous = self.ttimer.get(name).map(|t| t.ttl);
        let ttl = requested
            .map(Duration::from_secs)
            .or(previous)
            .unwrap_or(default_ttl);
        self.ttimer.insert(name.to_string(), EphemeralTimer { last: now, ttl });
    }

    /// Removes expired ephemeral topics from both the timer table and the
    /// subscription table. Returns the removed topic names.
    fn expire_ephemerals(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .ttimer
            .iter()
            .filter(|(_, t)| now.duration_since(t.last) > t.ttl)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            self.ttimer.remove(name);
            self.topics.remove(name);
            self.stats.etimo += 1;
        }
        if !expired.is_empty() {
            self.rebuild_wildcards();
        }
        expired
    }

    /// Removes every trace of a peer. Returns its pending watch entries so
    /// their callers can be notified.
    fn purge_peer(&mut self, cid: &str) -> Vec<WatchEntry> {
        for subscribers in self.topics.values_mut() {
            subscribers.retain(|s| s != cid);
        }
        for handlers in self.direct.values_mut() {
            handlers.retain(|h| h != cid);
        }
        self.clients.remove(cid);
        self.watch.remove(cid).unwrap_or_default()
    }

    /// Resolves one watch entry by replying cid and mid.
    fn take_watch_reply(&mut self, replier: &str, mid: &str) -> Option<WatchEntry> {
        let entries = self.watch.get_mut(replier)?;
        let at = entries.iter().position(|e| e.mid == mid)?;
        let entry = entries.remove(at);
        if entries.is_empty() {
            self.watch.remove(replier);
        }
        Some(entry)
    }

    fn locate(&self, name: &str) -> (Value, Value) {
        if name.is_empty() {
            (json!(self.topics), json!(self.direct))
        } else {
            (json!(self.topics.get(name)), json!(self.direct.get(name)))
        }
    }
}

/// The message broker. One instance per listen socket; all state dies with
/// the instance, so tests can run several brokers in one process.
pub struct Broker {
    config: BrokerConfig,
    /// Process-start timestamp broadcast as the liveness probe; a changed
    /// seed tells nodes the broker restarted.
    seed: u64,
    state: Mutex<RouterState>,
    strategy: Box<dyn SelectStrategy>,
}

impl Broker {
    /// Creates a broker with uniform-random call-target selection.
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_strategy(config, Box::new(UniformRandom))
    }

    /// Creates a broker with a custom call-target selection strategy.
    pub fn with_strategy(config: BrokerConfig, strategy: Box<dyn SelectStrategy>) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            config,
            seed,
            state: Mutex::new(RouterState::default()),
            strategy,
        }
    }

    /// The heartbeat seed this broker broadcasts.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Binds the router socket and starts the periodic sweep and stats
    /// tasks. The returned [`RunningBroker`] owns them all.
    pub async fn listen(self: &Arc<Self>) -> Result<RunningBroker> {
        let server = Server::serve(
            ServerConfig {
                bind_addr: self.config.bind_addr.clone(),
                secret: self.config.secret.clone(),
            },
            self.clone() as Arc<dyn FrameHandler>,
        )
        .await?;

        let sweeper = self.clone();
        let sweep_handle = server.handle().clone();
        let heartbeat = self.config.heartbeat;
        let sweep_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(heartbeat);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                sweeper.sweep(&sweep_handle);
            }
        });

        let reporter = self.clone();
        let stats_interval = self.config.stats_interval;
        let stats_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(stats_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first interval tick fires immediately; skip it
            tick.tick().await;
            loop {
                tick.tick().await;
                reporter.report_stats();
            }
        });

        Ok(RunningBroker {
            server,
            tasks: vec![sweep_task, stats_task],
        })
    }

    /// One sweep: evict silent peers (notifying their watchers), probe the
    /// living with the heartbeat seed, and expire idle ephemeral topics.
    fn sweep(&self, handle: &ServerHandle) {
        let now = Instant::now();
        let mut st = self.state.lock().unwrap();

        let dead: Vec<(Cid, Duration)> = st
            .clients
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > self.config.dead_after)
            .map(|(cid, last)| (cid.clone(), now.duration_since(*last)))
            .collect();

        for (cid, elapsed) in dead {
            let watchers = st.purge_peer(&cid);
            if !watchers.is_empty() {
                info!(cid, pending = watchers.len(), "evicting peer with watched calls");
            }
            // watcher notices are a side effect of the eviction, not
            // failed call deliveries; deads counts only the latter
            for entry in watchers {
                handle.send(
                    &entry.caller,
                    &Frame::Err {
                        msg: json!(format!("dead endpoint: {}", entry.topic)),
                        target: entry.target,
                        mid: entry.mid,
                    },
                );
            }
            handle.send(
                &cid,
                &Frame::Dead {
                    reason: "you have been marked dead".to_string(),
                    elapsed_ms: elapsed.as_millis() as u64,
                },
            );
            handle.remove(&cid);
            debug!(cid, elapsed_ms = elapsed.as_millis() as u64, "peer evicted");
        }

        for cid in st.clients.keys() {
            handle.send(cid, &Frame::Heartbeat(self.seed));
        }

        let expired = st.expire_ephemerals(now);
        if !expired.is_empty() {
            debug!(topics = ?expired, "ephemeral topics expired");
        }
    }

    fn report_stats(&self) {
        let mut st = self.state.lock().unwrap();
        if st.stats.is_empty() {
            return;
        }
        let s = st.stats.take();
        info!(
            pubs = s.pubs,
            subs = s.subs,
            epubs = s.epubs,
            esubs = s.esubs,
            etimo = s.etimo,
            hands = s.hands,
            calls = s.calls,
            repls = s.repls,
            errs = s.errs,
            deads = s.deads,
            "traffic stats"
        );
    }
}

#[async_trait]
impl FrameHandler for Broker {
    async fn on_frame(&self, frame: Frame, cid: &str, server: &ServerHandle) -> Option<Frame> {
        let now = Instant::now();
        let mut st = self.state.lock().unwrap();
        st.clients.insert(cid.to_string(), now);

        match frame {
            // liveness refresh only; handled above
            Frame::Heartbeat(_) => {}
            // consumed by the server transport; nothing to route
            Frame::Auth(_) => {}

            Frame::Sub { topic: name, opts } => {
                // re-registration (node replay, repeated subscribe) must
                // not duplicate the cid
                let subscribers = st.topics.entry(name.clone()).or_default();
                if !subscribers.iter().any(|s| s == cid) {
                    subscribers.push(cid.to_string());
                }
                st.rebuild_wildcards();
                st.arm_ephemeral(&name, opts.timeout, self.config.ephemeral_ttl, now);
                if topic::is_ephemeral(&name) {
                    st.stats.esubs += 1;
                } else {
                    st.stats.subs += 1;
                }
            }

            Frame::Pub { topic: name, msg, .. } => {
                let delivery = Frame::Pub {
                    topic: name.clone(),
                    msg,
                    from: Some(cid.to_string()),
                };
                for recipient in st.recipients_for(&name) {
                    server.send(&recipient, &delivery);
                }
                st.arm_ephemeral(&name, None, self.config.ephemeral_ttl, now);
                if topic::is_ephemeral(&name) {
                    st.stats.epubs += 1;
                } else {
                    st.stats.pubs += 1;
                }
            }

            Frame::Call { topic: name, msg, cid: target, mid } => {
                let chosen = if target.is_empty() {
                    st.direct
                        .get(&name)
                        .and_then(|candidates| self.strategy.pick(candidates))
                        .cloned()
                } else {
                    Some(target)
                };
                let delivered = chosen.as_ref().is_some_and(|t| {
                    server.send(
                        t,
                        &Frame::Call {
                            topic: name.clone(),
                            msg: msg.clone(),
                            cid: cid.to_string(),
                            mid: mid.clone(),
                        },
                    )
                });
                if delivered {
                    // fire-and-forget sends (empty mid) expect no reply,
                    // so there is nothing to watch
                    if !mid.is_empty() {
                        let target = chosen.unwrap_or_default();
                        st.watch.entry(target.clone()).or_default().push(WatchEntry {
                            caller: cid.to_string(),
                            topic: name,
                            target,
                            mid,
                        });
                    }
                    st.stats.calls += 1;
                } else {
                    warn!(cid, topic = name, target = ?chosen, "call target unreachable");
                    server.send(
                        cid,
                        &Frame::Err {
                            msg: json!(format!("dead endpoint: {name}")),
                            target: chosen.unwrap_or_default(),
                            mid,
                        },
                    );
                    st.stats.deads += 1;
                }
            }

            Frame::Repl { msg, mid } => match st.take_watch_reply(cid, &mid) {
                Some(entry) => {
                    server.send(&entry.caller, &Frame::Repl { msg, mid });
                    st.stats.repls += 1;
                }
                None => {
                    warn!(cid, mid, "reply without a watched call");
                }
            },

            Frame::Err { msg, target, mid } => {
                server.send(&target, &Frame::Err { msg, target: target.clone(), mid });
                st.stats.errs += 1;
            }

            Frame::Handle { topic: name } => {
                let handlers = st.direct.entry(name).or_default();
                if !handlers.iter().any(|h| h == cid) {
                    handlers.push(cid.to_string());
                }
                st.stats.hands += 1;
            }

            Frame::Locate { topic: name, mid } => {
                let (subs, direct) = st.locate(&name);
                server.send(cid, &Frame::Loc { subs, direct, mid });
            }

            other => {
                debug!(cid, frame = ?other, "ignoring frame not valid inbound");
            }
        }
        None
    }
}

/// A listening broker with its periodic tasks.
pub struct RunningBroker {
    server: Server,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningBroker {
    /// The address the router socket is bound to.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.server.local_addr()
    }

    /// Stops the listener and the periodic tasks.
    pub fn shutdown(&self) {
        self.server.shutdown();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for RunningBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_subs(entries: &[(&str, &[&str])]) -> RouterState {
        let mut st = RouterState::default();
        for (name, cids) in entries {
            st.topics.insert(
                name.to_string(),
                cids.iter().map(|c| c.to_string()).collect(),
            );
        }
        st.rebuild_wildcards();
        st
    }

    #[test]
    fn test_recipients_exact_wildcard_catchall_once_each() {
        let st = state_with_subs(&[
            ("org/app/event", &["A", "B"]),
            ("org/app/*", &["B", "C"]),
            ("org/other/*", &["D"]),
            ("*", &["C", "E"]),
        ]);
        let recipients = st.recipients_for("org/app/event");
        assert_eq!(recipients, ["A", "B", "C", "E"]);
    }

    #[test]
    fn test_recipients_no_match_only_catchall() {
        let st = state_with_subs(&[("org/app/*", &["A"]), ("*", &["B"])]);
        assert_eq!(st.recipients_for("hub/other"), ["B"]);
    }

    #[test]
    fn test_ephemeral_expiry_and_refresh() {
        let mut st = state_with_subs(&[("~session", &["A"])]);
        let start = Instant::now();
        st.arm_ephemeral("~session", Some(1), Duration::from_secs(300), start);

        // inside the window: refresh keeps the previous ttl
        let halfway = start + Duration::from_millis(600);
        st.arm_ephemeral("~session", None, Duration::from_secs(300), halfway);
        assert!(st.expire_ephemerals(start + Duration::from_millis(1100)).is_empty());
        assert!(st.topics.contains_key("~session"));

        // past the refreshed window: timer and subscription both go
        let expired = st.expire_ephemerals(halfway + Duration::from_millis(1100));
        assert_eq!(expired, ["~session"]);
        assert!(!st.topics.contains_key("~session"));
        assert!(!st.ttimer.contains_key("~session"));
        assert_eq!(st.stats.etimo, 1);
    }

    #[test]
    fn test_non_ephemeral_topics_never_get_timers() {
        let mut st = RouterState::default();
        st.arm_ephemeral("org/app", Some(1), Duration::from_secs(300), Instant::now());
        assert!(st.ttimer.is_empty());
    }

    #[test]
    fn test_purge_peer_clears_all_tables() {
        let mut st = state_with_subs(&[("news", &["A", "B"]), ("*", &["A"])]);
        st.direct.insert("svc".into(), vec!["A".into(), "C".into()]);
        st.clients.insert("A".into(), Instant::now());
        st.watch.insert(
            "A".into(),
            vec![WatchEntry {
                caller: "B".into(),
                topic: "svc".into(),
                target: "A".into(),
                mid: "m1".into(),
            }],
        );

        let watchers = st.purge_peer("A");
        assert_eq!(watchers.len(), 1);
        assert_eq!(watchers[0].caller, "B");
        assert_eq!(st.topics["news"], ["B"]);
        assert!(st.topics["*"].is_empty());
        assert_eq!(st.direct["svc"], ["C"]);
        assert!(!st.clients.contains_key("A"));
        assert!(!st.watch.contains_key("A"));
    }

    #[test]
    fn test_take_watch_reply_matches_mid() {
        let mut st = RouterState::default();
        st.watch.insert(
            "T".into(),
            vec![
                WatchEntry {
                    caller: "A".into(),
                    topic: "svc".into(),
                    target: "T".into(),
                    mid: "m1".into(),
                },
                WatchEntry {
                    caller: "B".into(),
                    topic: "svc".into(),
                    target: "T".into(),
                    mid: "m2".into(),
                },
            ],
        );

        assert!(st.take_watch_reply("T", "m9").is_none());
        let entry = st.take_watch_reply("T", "m2").unwrap();
        assert_eq!(entry.caller, "B");
        let entry = st.take_watch_reply("T", "m1").unwrap();
        assert_eq!(entry.caller, "A");
        // table entry removed once drained
        assert!(!st.watch.contains_key("T"));
    }

    #[test]
    fn test_locate_whole_tables_and_single_topic() {
        let mut st = state_with_subs(&[("news", &["A"])]);
        st.direct.insert("svc".into(), vec!["B".into()]);

        let (subs, direct) = st.locate("");
        assert_eq!(subs, json!({"news": ["A"]}));
        assert_eq!(direct, json!({"svc": ["B"]}));

        let (subs, direct) = st.locate("svc");
        assert_eq!(subs, json!(null));
        assert_eq!(direct, json!(["B"]));
    }

    #[test]
    fn test_seed_is_fixed_per_broker() {
        let broker = Broker::new(BrokerConfig::default());
        assert_eq!(broker.seed(), broker.seed());
        assert!(broker.seed() > 0);
    }

    async fn broker_with_server(config: BrokerConfig) -> (Arc<Broker>, Server) {
        let broker = Arc::new(Broker::new(config));
        let server = Server::serve(
            ServerConfig {
                bind_addr: "127.0.0.1:0".to_string(),
                secret: None,
            },
            broker.clone() as Arc<dyn FrameHandler>,
        )
        .await
        .unwrap();
        (broker, server)
    }

    #[tokio::test]
    async fn test_reregistration_keeps_one_table_entry() {
        let (broker, server) = broker_with_server(BrokerConfig::default()).await;

        // a node replaying its registrations resends sub and handle for
        // topics the broker may still know about
        for _ in 0..3 {
            broker
                .on_frame(
                    Frame::Sub {
                        topic: "news".into(),
                        opts: Default::default(),
                    },
                    "A",
                    server.handle(),
                )
                .await;
            broker
                .on_frame(
                    Frame::Handle {
                        topic: "jobs".into(),
                    },
                    "A",
                    server.handle(),
                )
                .await;
        }

        let st = broker.state.lock().unwrap();
        assert_eq!(st.topics["news"], ["A"]);
        assert_eq!(st.direct["jobs"], ["A"]);
    }

    #[tokio::test]
    async fn test_eviction_notices_leave_deads_untouched() {
        let config = BrokerConfig {
            dead_after: Duration::ZERO,
            ..BrokerConfig::default()
        };
        let (broker, server) = broker_with_server(config).await;
        {
            let mut st = broker.state.lock().unwrap();
            st.clients.insert("A".into(), Instant::now());
            st.watch.insert(
                "A".into(),
                vec![WatchEntry {
                    caller: "B".into(),
                    topic: "svc".into(),
                    target: "A".into(),
                    mid: "m1".into(),
                }],
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        broker.sweep(server.handle());

        let st = broker.state.lock().unwrap();
        assert!(!st.clients.contains_key("A"));
        assert!(!st.watch.contains_key("A"));
        assert_eq!(st.stats.deads, 0);
    }
}
