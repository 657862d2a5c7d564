//! Dealer-style client transport: one outbound connection to the broker.
//!
//! Offers fire-and-forget `send`, blocking `recv`, and a send-plus-one-recv
//! `call` convenience (uncorrelated, lowest-level request/response only).
//! The configured secret is resent on every (re)connect, and a dropped link
//! is automatically redialed after a fixed delay.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::frame::{read_body, Frame};
use crate::sendq::SendQueue;

/// Client transport configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker address, e.g. `127.0.0.1:6000`.
    pub addr: String,
    /// Shared secret sent as the first frame after every (re)connect.
    pub secret: Option<String>,
    /// Dial timeout.
    pub connect_timeout: Duration,
    /// Delay before redialing a dropped link.
    pub redial_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6000".to_string(),
            secret: None,
            connect_timeout: Duration::from_secs(5),
            redial_delay: Duration::from_millis(500),
        }
    }
}

struct ClientInner {
    config: ClientConfig,
    queue: StdMutex<Option<SendQueue>>,
    inbound_tx: mpsc::UnboundedSender<Frame>,
    running: AtomicBool,
    // bumped by disconnect so a superseded link task exits
    generation: AtomicU64,
}

/// A single outbound connection with automatic redial.
pub struct Client {
    inner: Arc<ClientInner>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
    link_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Creates a client for `config`. No connection is made until
    /// [`Client::connect`].
    pub fn new(config: ClientConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ClientInner {
                config,
                queue: StdMutex::new(None),
                inbound_tx,
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
            inbound_rx: Mutex::new(inbound_rx),
            link_task: StdMutex::new(None),
        }
    }

    /// Starts the link task. Waits for the first dial to resolve so
    /// callers can send immediately; later drops redial in the background.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let reader = dial(&self.inner).await?;
        debug!(addr = %self.inner.config.addr, "connected");
        let inner = self.inner.clone();
        let task = tokio::spawn(run_link(inner, generation, Some(reader)));
        *self.link_task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Tears the link down and stops redialing.
    pub fn disconnect(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *self.inner.queue.lock().unwrap() = None;
        if let Some(task) = self.link_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Disconnects and dials again.
    pub async fn reconnect(&self) -> Result<()> {
        self.disconnect();
        self.connect().await
    }

    /// Enqueues a frame. Errors when the link is down.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        let queue = self.inner.queue.lock().unwrap().clone();
        match queue {
            Some(queue) => queue.send(frame),
            None => Err(TransportError::NotConnected),
        }
    }

    /// Waits for the next inbound frame.
    pub async fn recv(&self) -> Result<Frame> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    /// Lowest-level request/response: `send` followed by one `recv`. The
    /// reply is whatever frame arrives next; no mid correlation.
    pub async fn call(&self, frame: &Frame) -> Result<Frame> {
        self.send(frame)?;
        self.recv().await
    }

    /// True while the link task holds an established connection.
    pub fn is_connected(&self) -> bool {
        self.inner.queue.lock().unwrap().is_some()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Dials once and installs the send queue + reader for the new socket.
async fn dial(inner: &Arc<ClientInner>) -> Result<TcpReader> {
    let timeout = inner.config.connect_timeout;
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&inner.config.addr))
        .await
        .map_err(|_| TransportError::ConnectionTimeout {
            addr: inner.config.addr.clone(),
            timeout_ms: timeout.as_millis() as u64,
        })??;
    let (reader, writer) = stream.into_split();
    let queue = SendQueue::new(writer);
    if let Some(secret) = &inner.config.secret {
        queue.send(&Frame::Auth(secret.clone()))?;
    }
    *inner.queue.lock().unwrap() = Some(queue);
    Ok(reader)
}

type TcpReader = tokio::net::tcp::OwnedReadHalf;

/// Owns the link for its lifetime: read until failure, then redial.
async fn run_link(inner: Arc<ClientInner>, generation: u64, mut established: Option<TcpReader>) {
    loop {
        if !inner.running.load(Ordering::SeqCst)
            || inner.generation.load(Ordering::SeqCst) != generation
        {
            return;
        }
        let socket_reader = match established.take() {
            Some(reader) => reader,
            None => match dial(&inner).await {
                Ok(reader) => reader,
                Err(error) => {
                    warn!(addr = %inner.config.addr, %error, "dial failed, will retry");
                    tokio::time::sleep(inner.config.redial_delay).await;
                    continue;
                }
            },
        };
        read_until_failure(&inner, socket_reader).await;
        *inner.queue.lock().unwrap() = None;
        if inner.running.load(Ordering::SeqCst) {
            debug!(addr = %inner.config.addr, "link down, redialing");
            tokio::time::sleep(inner.config.redial_delay).await;
        }
    }
}

async fn read_until_failure(inner: &Arc<ClientInner>, mut reader: TcpReader) {
    loop {
        let body = match read_body(&mut reader).await {
            Ok(body) => body,
            Err(error) => {
                debug!(%error, "read failed");
                return;
            }
        };
        match Frame::from_slice(&body) {
            Ok(frame) => {
                if inner.inbound_tx.send(frame).is_err() {
                    return;
                }
            }
            Err(error) => {
                warn!(%error, "discarding malformed frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{FrameHandler, Server, ServerConfig, ServerHandle};
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl FrameHandler for Echo {
        async fn on_frame(
            &self,
            frame: Frame,
            _cid: &str,
            _server: &ServerHandle,
        ) -> Option<Frame> {
            Some(frame)
        }
    }

    async fn echo_server(secret: Option<&str>) -> Server {
        Server::serve(
            ServerConfig {
                bind_addr: "127.0.0.1:0".to_string(),
                secret: secret.map(str::to_string),
            },
            Arc::new(Echo),
        )
        .await
        .unwrap()
    }

    fn client_for(server: &Server, secret: Option<&str>) -> Client {
        Client::new(ClientConfig {
            addr: server.local_addr().to_string(),
            secret: secret.map(str::to_string),
            redial_delay: Duration::from_millis(50),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_send_before_connect_errors() {
        let server = echo_server(None).await;
        let client = client_for(&server, None);
        let err = client.send(&Frame::Heartbeat(1)).unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let server = echo_server(None).await;
        let client = client_for(&server, None);
        client.connect().await.unwrap();

        let sent = Frame::Pub {
            topic: "ping".into(),
            msg: json!({"n": 7}),
            from: None,
        };
        let reply = client.call(&sent).await.unwrap();
        assert_eq!(reply, sent);
    }

    #[tokio::test]
    async fn test_secret_resent_after_redial() {
        let server = echo_server(Some("tok")).await;
        let client = client_for(&server, Some("tok"));
        client.connect().await.unwrap();

        let reply = client.call(&Frame::Heartbeat(1)).await.unwrap();
        assert_eq!(reply, Frame::Heartbeat(1));

        client.reconnect().await.unwrap();
        // auth must have been resent or the echo would never come back
        let reply = client.call(&Frame::Heartbeat(2)).await.unwrap();
        assert_eq!(reply, Frame::Heartbeat(2));
    }

    #[tokio::test]
    async fn test_is_connected_lifecycle() {
        let server = echo_server(None).await;
        let client = client_for(&server, None);
        assert!(!client.is_connected());
        client.connect().await.unwrap();
        assert!(client.is_connected());
        client.disconnect();
        assert!(!client.is_connected());
    }
}
