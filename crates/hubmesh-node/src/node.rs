//! The node API and its link state machine.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use hubmesh_transport::topic;
use hubmesh_transport::{Cid, Client, ClientConfig, Frame, Mid, SubOpts};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};

/// Serves calls for one topic. Implemented for any async closure of the
/// right shape, so `node.handle("echo", |msg, _topic, _from| async move {
/// Ok(msg) })` works directly.
pub trait CallHandler: Send + Sync + 'static {
    /// Handles one call and produces the reply payload, or an error string
    /// that is sent back to the caller as an `err` frame.
    fn call(
        &self,
        msg: Value,
        topic: String,
        from: Cid,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<Value, String>> + Send>>;
}

impl<F, Fut> CallHandler for F
where
    F: Fn(Value, String, Cid) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
{
    fn call(
        &self,
        msg: Value,
        topic: String,
        from: Cid,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<Value, String>> + Send>> {
        Box::pin((self)(msg, topic, from))
    }
}

type SubFn = Arc<dyn Fn(Value, Cid, String) + Send + Sync>;
type LifecycleFn = Arc<dyn Fn() + Send + Sync>;
type PendingTx = oneshot::Sender<Result<Value>>;

struct Subscription {
    handler: SubFn,
    opts: SubOpts,
}

/// Discovery result: current subscription and handler table contents, as
/// reported by the broker. Whole tables when no topic was given, a single
/// entry (or null) otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct Located {
    /// Subscription table contents.
    pub subs: Value,
    /// Handler table contents.
    pub direct: Value,
}

struct NodeInner {
    config: NodeConfig,
    client: Client,
    /// This node's own probe seed, sent to the broker each heartbeat.
    seed: u64,
    subs: Mutex<HashMap<String, Subscription>>,
    /// Cached subscription keys ending in `/*`.
    substar: Mutex<Vec<String>>,
    handlers: Mutex<HashMap<String, Arc<dyn CallHandler>>>,
    pending: Mutex<HashMap<Mid, PendingTx>>,
    /// Last heartbeat seed observed from the broker; `None` until the
    /// first one arrives.
    last_seed: Mutex<Option<u64>>,
    /// Set when registrations must be resent on the next broker heartbeat
    /// (after a dead notice or a detected outage).
    needs_replay: AtomicBool,
    last_traffic: Mutex<Instant>,
    up: AtomicBool,
    on_connect: Mutex<Vec<LifecycleFn>>,
    on_reconnect: Mutex<Vec<LifecycleFn>>,
    on_disconnect: Mutex<Vec<LifecycleFn>>,
}

/// A connected node. Dropping it tears down its background tasks.
pub struct Node {
    inner: Arc<NodeInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Connects to the broker and starts the receive loop and heartbeat
    /// monitor.
    pub async fn connect(config: NodeConfig) -> Result<Node> {
        let client = Client::new(ClientConfig {
            addr: config.addr.clone(),
            secret: config.secret.clone(),
            connect_timeout: config.connect_timeout,
            redial_delay: config.redial_delay,
        });
        client.connect().await?;

        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let inner = Arc::new(NodeInner {
            config,
            client,
            seed,
            subs: Mutex::new(HashMap::new()),
            substar: Mutex::new(Vec::new()),
            handlers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            last_seed: Mutex::new(None),
            needs_replay: AtomicBool::new(false),
            last_traffic: Mutex::new(Instant::now()),
            up: AtomicBool::new(true),
            on_connect: Mutex::new(Vec::new()),
            on_reconnect: Mutex::new(Vec::new()),
            on_disconnect: Mutex::new(Vec::new()),
        });

        let recv_inner = inner.clone();
        let recv_task = tokio::spawn(async move {
            while let Ok(frame) = recv_inner.client.recv().await {
                recv_inner.clone().dispatch(frame).await;
            }
        });

        let monitor_inner = inner.clone();
        let monitor_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(monitor_inner.config.heartbeat);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                monitor_inner.monitor_tick();
            }
        });

        Ok(Node {
            inner,
            tasks: vec![recv_task, monitor_task],
        })
    }

    /// Publishes `msg` to `topic`.
    pub fn publish(&self, topic: &str, msg: Value) -> Result<()> {
        self.inner.client.send(&Frame::Pub {
            topic: topic.to_string(),
            msg,
            from: None,
        })?;
        Ok(())
    }

    /// Subscribes to `topic`, invoking `handler(msg, from, topic)` for each
    /// matching publication. For ephemeral topics, `ttl` sets the broker's
    /// inactivity timeout.
    pub fn subscribe<F>(&self, topic: &str, handler: F, ttl: Option<Duration>) -> Result<()>
    where
        F: Fn(Value, Cid, String) + Send + Sync + 'static,
    {
        let opts = SubOpts {
            timeout: ttl.map(|d| d.as_secs().max(1)),
        };
        {
            let mut subs = self.inner.subs.lock().unwrap();
            subs.insert(
                topic.to_string(),
                Subscription {
                    handler: Arc::new(handler),
                    opts: opts.clone(),
                },
            );
            *self.inner.substar.lock().unwrap() = subs
                .keys()
                .filter(|k| topic::is_wildcard(k))
                .cloned()
                .collect();
        }
        self.inner.client.send(&Frame::Sub {
            topic: topic.to_string(),
            opts,
        })?;
        Ok(())
    }

    /// Calls whichever handler the broker picks for `topic` and waits for
    /// the reply.
    pub async fn call(&self, topic: &str, msg: Value) -> Result<Value> {
        self.inner.call_target("", topic, msg).await
    }

    /// Calls a specific peer's handler for `topic`.
    pub async fn call_to(&self, target: &str, topic: &str, msg: Value) -> Result<Value> {
        self.inner.call_target(target, topic, msg).await
    }

    /// Like [`Node::call`] but gives up after `deadline`. The deadline is
    /// purely local: the wire protocol is unchanged and a late reply is
    /// discarded.
    pub async fn call_with_deadline(
        &self,
        topic: &str,
        msg: Value,
        deadline: Duration,
    ) -> Result<Value> {
        let (mid, rx) = self.inner.start_call("", topic, msg)?;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NodeError::LinkDown),
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&mid);
                Err(NodeError::DeadlineExceeded(deadline))
            }
        }
    }

    /// Directed fire-and-forget message to `target`'s handler for `topic`.
    /// No reply is expected or routed.
    pub fn send(&self, target: &str, topic: &str, msg: Value) -> Result<()> {
        self.inner.client.send(&Frame::Call {
            topic: topic.to_string(),
            msg,
            cid: target.to_string(),
            mid: String::new(),
        })?;
        Ok(())
    }

    /// Registers as a call target for `topic`.
    pub fn handle<H: CallHandler>(&self, topic: &str, handler: H) -> Result<()> {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .insert(topic.to_string(), Arc::new(handler));
        self.inner.client.send(&Frame::Handle {
            topic: topic.to_string(),
        })?;
        Ok(())
    }

    /// Asks the broker who currently subscribes to / handles `topic`, or
    /// for the whole tables when `topic` is `None`.
    pub async fn locate(&self, topic: Option<&str>) -> Result<Located> {
        let mid = new_mid();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(mid.clone(), tx);
        if let Err(error) = self.inner.client.send(&Frame::Locate {
            topic: topic.unwrap_or_default().to_string(),
            mid: mid.clone(),
        }) {
            self.inner.pending.lock().unwrap().remove(&mid);
            return Err(error.into());
        }
        let value = match rx.await {
            Ok(result) => result?,
            Err(_) => return Err(NodeError::LinkDown),
        };
        Ok(Located {
            subs: value.get("subs").cloned().unwrap_or(Value::Null),
            direct: value.get("direct").cloned().unwrap_or(Value::Null),
        })
    }

    /// Registers a callback fired when the broker is first seen alive.
    pub fn on_connect<F: Fn() + Send + Sync + 'static>(&self, f: F) -> &Self {
        self.inner.on_connect.lock().unwrap().push(Arc::new(f));
        self
    }

    /// Registers a callback fired on every link resumption after the
    /// first, once registrations have been replayed.
    pub fn on_reconnect<F: Fn() + Send + Sync + 'static>(&self, f: F) -> &Self {
        self.inner.on_reconnect.lock().unwrap().push(Arc::new(f));
        self
    }

    /// Registers a callback fired when the broker goes silent past the
    /// dead-client threshold.
    pub fn on_disconnect<F: Fn() + Send + Sync + 'static>(&self, f: F) -> &Self {
        self.inner.on_disconnect.lock().unwrap().push(Arc::new(f));
        self
    }

    /// Current liveness of the broker link.
    pub fn is_connected(&self) -> bool {
        self.inner.up.load(Ordering::SeqCst)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.inner.client.disconnect();
    }
}

impl NodeInner {
    fn start_call(
        &self,
        target: &str,
        topic: &str,
        msg: Value,
    ) -> Result<(Mid, oneshot::Receiver<Result<Value>>)> {
        let mid = new_mid();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(mid.clone(), tx);
        if let Err(error) = self.client.send(&Frame::Call {
            topic: topic.to_string(),
            msg,
            cid: target.to_string(),
            mid: mid.clone(),
        }) {
            self.pending.lock().unwrap().remove(&mid);
            return Err(error.into());
        }
        Ok((mid, rx))
    }

    async fn call_target(&self, target: &str, topic: &str, msg: Value) -> Result<Value> {
        let (_mid, rx) = self.start_call(target, topic, msg)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(NodeError::LinkDown),
        }
    }

    async fn dispatch(self: Arc<Self>, frame: Frame) {
        *self.last_traffic.lock().unwrap() = Instant::now();
        if !self.up.swap(true, Ordering::SeqCst) {
            debug!("broker traffic resumed");
        }

        match frame {
            Frame::Heartbeat(seed) => self.on_heartbeat(seed),

            Frame::Pub { topic: name, msg, from } => {
                let handler = self.resolve_subscription(&name);
                match handler {
                    Some(handler) => handler(msg, from.unwrap_or_default(), name),
                    None => debug!(topic = name, "publication without a local subscription"),
                }
            }

            Frame::Call { topic: name, msg, cid: from, mid } => {
                let handler = self.handlers.lock().unwrap().get(&name).cloned();
                match handler {
                    None => warn!(topic = name, "call for a topic with no local handler"),
                    Some(handler) => {
                        let inner = self.clone();
                        tokio::spawn(async move {
                            let result = handler.call(msg, name, from.clone()).await;
                            if mid.is_empty() {
                                // fire-and-forget send; nobody is waiting
                                return;
                            }
                            let reply = match result {
                                Ok(value) => Frame::Repl { msg: value, mid },
                                Err(error) => Frame::Err {
                                    msg: json!(error),
                                    target: from,
                                    mid,
                                },
                            };
                            if let Err(error) = inner.client.send(&reply) {
                                warn!(%error, "reply send failed");
                            }
                        });
                    }
                }
            }

            Frame::Repl { msg, mid } => self.resolve_pending(&mid, Ok(msg)),

            Frame::Loc { subs, direct, mid } => {
                self.resolve_pending(&mid, Ok(json!({ "subs": subs, "direct": direct })))
            }

            Frame::Err { msg, mid, .. } => {
                let text = msg
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| msg.to_string());
                if mid.is_empty() {
                    // error for a fire-and-forget send; nothing to resolve
                    debug!(error = text, "error frame without correlation");
                } else {
                    self.resolve_pending(&mid, Err(NodeError::Remote(text)));
                }
            }

            Frame::Dead { reason, elapsed_ms } => {
                warn!(reason, elapsed_ms, "broker marked this node dead, reconnecting");
                self.needs_replay.store(true, Ordering::SeqCst);
                if let Err(error) = self.client.reconnect().await {
                    warn!(%error, "reconnect after dead notice failed");
                }
            }

            other => debug!(frame = ?other, "ignoring frame not valid inbound"),
        }
    }

    fn resolve_subscription(&self, published: &str) -> Option<SubFn> {
        let subs = self.subs.lock().unwrap();
        if let Some(sub) = subs.get(published) {
            return Some(sub.handler.clone());
        }
        for key in self.substar.lock().unwrap().iter() {
            if topic::wildcard_matches(key, published) {
                if let Some(sub) = subs.get(key) {
                    return Some(sub.handler.clone());
                }
            }
        }
        subs.get(topic::CATCH_ALL).map(|sub| sub.handler.clone())
    }

    fn resolve_pending(&self, mid: &str, result: Result<Value>) {
        let tx = self.pending.lock().unwrap().remove(mid);
        match tx {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => warn!(mid, "reply without a pending request"),
        }
    }

    /// Link state machine, driven by broker heartbeat seeds: the first
    /// seed fires `on_connect`; a changed seed (broker restart) or a
    /// forced replay resends every registration, then fires
    /// `on_reconnect`.
    fn on_heartbeat(&self, seed: u64) {
        if self.config.debug {
            trace!(seed, "broker heartbeat");
        }
        let replay = self.needs_replay.swap(false, Ordering::SeqCst);
        let event = {
            let mut last = self.last_seed.lock().unwrap();
            let event = match *last {
                None => LinkEvent::Connected,
                Some(prev) if prev != seed || replay => LinkEvent::Resumed,
                _ => LinkEvent::Steady,
            };
            *last = Some(seed);
            event
        };
        match event {
            LinkEvent::Connected => fire(&self.on_connect),
            LinkEvent::Resumed => {
                self.replay_registrations();
                fire(&self.on_reconnect);
            }
            LinkEvent::Steady => {}
        }
    }

    /// Resends every active subscription and handler registration, ahead
    /// of any new traffic from this node.
    fn replay_registrations(&self) {
        debug!("replaying registrations");
        {
            let subs = self.subs.lock().unwrap();
            for (name, sub) in subs.iter() {
                let _ = self.client.send(&Frame::Sub {
                    topic: name.clone(),
                    opts: sub.opts.clone(),
                });
            }
        }
        {
            let handlers = self.handlers.lock().unwrap();
            for name in handlers.keys() {
                let _ = self.client.send(&Frame::Handle { topic: name.clone() });
            }
        }
    }

    fn monitor_tick(&self) {
        // keep probing even while down so the broker relearns this node
        // as soon as the link is redialed
        let _ = self.client.send(&Frame::Heartbeat(self.seed));

        if self.up.load(Ordering::SeqCst) {
            let silent = self.last_traffic.lock().unwrap().elapsed();
            if silent > self.config.dead_after {
                warn!(silent_ms = silent.as_millis() as u64, "broker silent, marking link down");
                self.up.store(false, Ordering::SeqCst);
                self.needs_replay.store(true, Ordering::SeqCst);
                fire(&self.on_disconnect);
            }
            if self.config.debug {
                trace!(silent_ms = silent.as_millis() as u64, "link monitor");
            }
        } else {
            // nobody should wait on a dead link
            let stale: Vec<PendingTx> = {
                let mut pending = self.pending.lock().unwrap();
                pending.drain().map(|(_, tx)| tx).collect()
            };
            for tx in stale {
                let _ = tx.send(Err(NodeError::LinkDown));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkEvent {
    Connected,
    Resumed,
    Steady,
}

fn fire(callbacks: &Mutex<Vec<LifecycleFn>>) {
    let list: Vec<LifecycleFn> = callbacks.lock().unwrap().clone();
    for callback in list {
        callback();
    }
}

fn new_mid() -> Mid {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mids_are_unique() {
        let a = new_mid();
        let b = new_mid();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }

    #[tokio::test]
    async fn test_closure_is_a_call_handler() {
        let handler = |msg: Value, _topic: String, _from: Cid| async move { Ok(msg) };
        let reply = CallHandler::call(&handler, json!({"x": 1}), "echo".into(), "A".into())
            .await
            .unwrap();
        assert_eq!(reply, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_failing_handler_reports_error_string() {
        let handler =
            |_msg: Value, _topic: String, _from: Cid| async move { Err("boom".to_string()) };
        let err = CallHandler::call(&handler, json!(null), "svc".into(), "A".into())
            .await
            .unwrap_err();
        assert_eq!(err, "boom");
    }
}
