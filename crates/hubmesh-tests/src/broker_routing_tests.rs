//! End-to-end routing: fan-out, call dispatch, discovery, ephemeral GC,
//! and the auth gate, all over real sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use hubmesh_node::NodeError;
use hubmesh_transport::{Client, ClientConfig, Frame, SubOpts};

use crate::harness::{fast_node_config, wait_for, TestCluster};

/// Registrations travel on a different connection than the traffic that
/// depends on them; give the broker a moment to apply them.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_call_round_trip() {
    let cluster = TestCluster::start().await;
    let server = cluster.node().await;
    server
        .handle("echo", |msg: Value, _topic: String, _from: String| async move { Ok(msg) })
        .unwrap();
    settle().await;

    let caller = cluster.node().await;
    let reply = caller.call("echo", json!({"n": 41})).await.unwrap();
    assert_eq!(reply, json!({"n": 41}));
}

#[tokio::test]
async fn test_handler_error_reaches_caller() {
    let cluster = TestCluster::start().await;
    let server = cluster.node().await;
    server
        .handle("fails", |_msg: Value, _topic: String, _from: String| async move {
            Err("boom".to_string())
        })
        .unwrap();
    settle().await;

    let caller = cluster.node().await;
    let err = caller.call("fails", json!(null)).await.unwrap_err();
    assert!(matches!(err, NodeError::Remote(ref m) if m == "boom"));
}

#[tokio::test]
async fn test_call_without_handler_is_dead_endpoint() {
    let cluster = TestCluster::start().await;
    let caller = cluster.node().await;
    let err = caller.call("nobody/serves/this", json!(null)).await.unwrap_err();
    assert!(err.is_dead_endpoint());
}

#[tokio::test]
async fn test_wildcard_fanout_delivers_once_per_node() {
    let cluster = TestCluster::start().await;

    // three overlapping patterns on one node must yield one delivery
    let subscriber = cluster.node().await;
    let hits = Arc::new(AtomicUsize::new(0));
    for pattern in ["org/app/event", "org/app/*", "*"] {
        let hits = hits.clone();
        subscriber
            .subscribe(
                pattern,
                move |_msg: Value, _from: String, _topic: String| {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                None,
            )
            .unwrap();
    }

    let bystander = cluster.node().await;
    let bystander_hits = Arc::new(AtomicUsize::new(0));
    {
        let bystander_hits = bystander_hits.clone();
        bystander
            .subscribe(
                "org/other/*",
                move |_msg: Value, _from: String, _topic: String| {
                    bystander_hits.fetch_add(1, Ordering::SeqCst);
                },
                None,
            )
            .unwrap();
    }
    settle().await;

    let publisher = cluster.node().await;
    publisher.publish("org/app/event", json!("hello")).unwrap();

    assert!(wait_for(Duration::from_secs(2), || hits.load(Ordering::SeqCst) >= 1).await);
    // no duplicate delivery trickles in afterwards
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(bystander_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_subscription_handler_sees_topic_and_sender() {
    let cluster = TestCluster::start().await;
    let subscriber = cluster.node().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        subscriber
            .subscribe(
                "org/app/*",
                move |msg: Value, from: String, topic: String| {
                    seen.lock().unwrap().push((msg, from, topic));
                },
                None,
            )
            .unwrap();
    }
    settle().await;

    let publisher = cluster.node().await;
    publisher.publish("org/app/started", json!({"v": 3})).unwrap();

    assert!(wait_for(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()).await);
    let (msg, from, topic) = seen.lock().unwrap()[0].clone();
    assert_eq!(msg, json!({"v": 3}));
    assert_eq!(topic, "org/app/started");
    // the broker stamps the publisher's cid onto the delivery
    assert!(!from.is_empty());
}

#[tokio::test]
async fn test_directed_send_and_locate() {
    let cluster = TestCluster::start().await;
    let worker = cluster.node().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        worker
            .handle("notify", move |msg: Value, _topic: String, _from: String| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(msg);
                    Ok(Value::Null)
                }
            })
            .unwrap();
    }
    settle().await;

    let caller = cluster.node().await;
    let located = caller.locate(Some("notify")).await.unwrap();
    let target = located
        .direct
        .as_array()
        .and_then(|cids| cids.first())
        .and_then(Value::as_str)
        .expect("locate should list the worker's cid")
        .to_string();

    caller.send(&target, "notify", json!({"job": 9})).unwrap();
    assert!(wait_for(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()).await);
    assert_eq!(seen.lock().unwrap()[0], json!({"job": 9}));
}

#[tokio::test]
async fn test_locate_whole_tables() {
    let cluster = TestCluster::start().await;
    let node = cluster.node().await;
    node.subscribe("news", |_msg: Value, _from: String, _topic: String| {}, None)
        .unwrap();
    node.handle("jobs", |msg: Value, _topic: String, _from: String| async move { Ok(msg) })
        .unwrap();
    settle().await;

    let located = node.locate(None).await.unwrap();
    assert!(located.subs.get("news").is_some());
    assert!(located.direct.get("jobs").is_some());
}

#[tokio::test]
async fn test_ephemeral_topic_expires_and_traffic_refreshes() {
    let cluster = TestCluster::start().await;
    let node = cluster.node().await;
    node.subscribe(
        "~session",
        |_msg: Value, _from: String, _topic: String| {},
        Some(Duration::from_secs(1)),
    )
    .unwrap();
    settle().await;

    let located = node.locate(Some("~session")).await.unwrap();
    assert!(!located.subs.is_null());

    // a publication inside the window restarts the inactivity timer
    tokio::time::sleep(Duration::from_millis(450)).await;
    node.publish("~session", json!("still here")).unwrap();

    // past the original deadline but inside the refreshed one
    tokio::time::sleep(Duration::from_millis(700)).await;
    let located = node.locate(Some("~session")).await.unwrap();
    assert!(!located.subs.is_null(), "refresh should have kept the topic");

    // no further traffic: the topic must be collected
    tokio::time::sleep(Duration::from_secs(2)).await;
    let located = node.locate(Some("~session")).await.unwrap();
    assert!(located.subs.is_null(), "idle ephemeral topic should expire");
}

#[tokio::test]
async fn test_call_deadline_expires_locally() {
    let cluster = TestCluster::start().await;
    let server = cluster.node().await;
    server
        .handle("slow", |msg: Value, _topic: String, _from: String| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(msg)
        })
        .unwrap();
    settle().await;

    let caller = cluster.node().await;
    let err = caller
        .call_with_deadline("slow", json!(1), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::DeadlineExceeded(_)));
}

#[tokio::test]
async fn test_repeated_registrations_do_not_duplicate() {
    let mut config = crate::harness::fast_broker_config();
    config.dead_after = Duration::from_secs(5);
    let cluster = TestCluster::start_with(config).await;

    let peer = Client::new(ClientConfig {
        addr: cluster.addr(),
        ..Default::default()
    });
    peer.connect().await.unwrap();
    for _ in 0..3 {
        peer.send(&Frame::Sub {
            topic: "news".to_string(),
            opts: SubOpts::default(),
        })
        .unwrap();
        peer.send(&Frame::Handle {
            topic: "jobs".to_string(),
        })
        .unwrap();
    }
    settle().await;

    let observer = cluster.node().await;
    let located = observer.locate(None).await.unwrap();
    assert_eq!(located.subs["news"].as_array().map(Vec::len), Some(1));
    assert_eq!(located.direct["jobs"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_wrong_secret_mutates_nothing() {
    let mut config = crate::harness::fast_broker_config();
    config.secret = Some("hub-secret".to_string());
    let cluster = TestCluster::start_with(config).await;

    // a raw client with the wrong secret; its frames must all be dropped
    let intruder = Client::new(ClientConfig {
        addr: cluster.addr(),
        secret: Some("not-the-secret".to_string()),
        ..Default::default()
    });
    intruder.connect().await.unwrap();
    intruder
        .send(&Frame::Sub {
            topic: "forged".to_string(),
            opts: SubOpts::default(),
        })
        .unwrap();

    let mut node_config = fast_node_config(cluster.addr());
    node_config.secret = Some("hub-secret".to_string());
    let node = hubmesh_node::Node::connect(node_config).await.unwrap();
    node.subscribe("real", |_msg: Value, _from: String, _topic: String| {}, None)
        .unwrap();
    settle().await;

    let located = node.locate(None).await.unwrap();
    assert!(located.subs.get("real").is_some());
    assert!(located.subs.get("forged").is_none());
}

#[tokio::test]
async fn test_silent_peer_is_evicted() {
    let cluster = TestCluster::start().await;

    // a raw client that registers a handler and then never heartbeats
    let mute = Client::new(ClientConfig {
        addr: cluster.addr(),
        ..Default::default()
    });
    mute.connect().await.unwrap();
    mute.send(&Frame::Handle {
        topic: "svc".to_string(),
    })
    .unwrap();

    // well past the broker's 400ms eviction threshold
    tokio::time::sleep(Duration::from_secs(1)).await;

    let caller = cluster.node().await;
    let located = caller.locate(Some("svc")).await.unwrap();
    assert!(located.direct.is_null() || located.direct == json!([]));
    let err = caller.call("svc", json!(null)).await.unwrap_err();
    assert!(err.is_dead_endpoint());
}

#[tokio::test]
async fn test_caller_notified_when_target_dies_mid_call() {
    let cluster = TestCluster::start().await;

    // registers a handler, accepts the call, never replies, never beats
    let mute = Client::new(ClientConfig {
        addr: cluster.addr(),
        ..Default::default()
    });
    mute.connect().await.unwrap();
    mute.send(&Frame::Handle {
        topic: "svc".to_string(),
    })
    .unwrap();
    settle().await;

    let caller = cluster.node().await;
    let call = tokio::spawn(async move { caller.call("svc", json!(1)).await });
    let result = tokio::time::timeout(Duration::from_secs(3), call)
        .await
        .expect("eviction should resolve the call")
        .unwrap();
    let err = result.unwrap_err();
    assert!(err.is_dead_endpoint());
}
