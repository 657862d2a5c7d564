//! Router-style server transport.
//!
//! Binds a TCP listener and multiplexes many remote peers, each identified
//! by an opaque connection id (cid). Performs the one-time shared-secret
//! check per peer and hands every good frame to a [`FrameHandler`]
//! together with a [`ServerHandle`] that can reach any live peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::frame::{read_body, Cid, Frame};
use crate::sendq::SendQueue;

/// Server transport configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, e.g. `0.0.0.0:6000`. Port 0 picks a free port.
    pub bind_addr: String,
    /// Shared secret each peer must present as its first frame. `None`
    /// disables the auth gate.
    pub secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:6000".to_string(),
            secret: None,
        }
    }
}

/// Receives every authenticated inbound frame.
///
/// Returning `Some(frame)` sends that frame straight back to the peer: the
/// low-level request/response path, distinct from the call/repl protocol
/// the broker layers on top.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    /// Handles one inbound frame from `cid`.
    async fn on_frame(&self, frame: Frame, cid: &str, server: &ServerHandle) -> Option<Frame>;
}

struct Peer {
    queue: SendQueue,
}

/// Cloneable handle for sending to any live peer.
#[derive(Clone)]
pub struct ServerHandle {
    peers: Arc<Mutex<HashMap<Cid, Peer>>>,
}

impl ServerHandle {
    fn new() -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Enqueues `frame` for `cid`. Returns false (and logs) when the cid
    /// has no live registration: a dead endpoint.
    pub fn send(&self, cid: &str, frame: &Frame) -> bool {
        let queue = {
            let peers = self.peers.lock().unwrap();
            peers.get(cid).map(|p| p.queue.clone())
        };
        match queue {
            Some(queue) => match queue.send(frame) {
                Ok(()) => true,
                Err(error) => {
                    warn!(cid, %error, "send to peer failed");
                    false
                }
            },
            None => {
                warn!(cid, ?frame, "send to missing cid");
                false
            }
        }
    }

    /// Drops the registration for `cid`. A later frame from the same
    /// connection re-registers it.
    pub fn remove(&self, cid: &str) {
        self.peers.lock().unwrap().remove(cid);
    }

    /// Number of currently registered peers.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    fn register(&self, cid: &str, queue: &SendQueue) {
        let mut peers = self.peers.lock().unwrap();
        peers.entry(cid.to_string()).or_insert_with(|| Peer {
            queue: queue.clone(),
        });
    }
}

/// A bound, running server transport.
pub struct Server {
    handle: ServerHandle,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Server {
    /// Binds `config.bind_addr` and starts accepting connections, feeding
    /// every authenticated frame to `handler`.
    pub async fn serve(config: ServerConfig, handler: Arc<dyn FrameHandler>) -> Result<Server> {
        let addr: SocketAddr = config
            .bind_addr
            .parse()
            .map_err(|e| TransportError::InvalidFrame {
                reason: format!("bad bind address {}: {e}", config.bind_addr),
            })?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        // allows a restarted broker to rebind its port immediately
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(1024)?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, secured = config.secret.is_some(), "listening");

        let handle = ServerHandle::new();
        let accept_handle = handle.clone();
        let conn_tasks = Arc::new(Mutex::new(Vec::new()));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            config,
            handler,
            accept_handle,
            conn_tasks.clone(),
        ));

        Ok(Server {
            handle,
            local_addr,
            accept_task,
            conn_tasks,
        })
    }

    /// Handle for sending to connected peers.
    pub fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    /// The address the server is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and closes every live connection.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        for task in self.conn_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.handle.peers.lock().unwrap().clear();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: ServerConfig,
    handler: Arc<dyn FrameHandler>,
    handle: ServerHandle,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let next_cid = AtomicU32::new(1);
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(error) => {
                warn!(%error, "accept failed");
                continue;
            }
        };
        let cid = encode_cid(next_cid.fetch_add(1, Ordering::Relaxed));
        debug!(cid, peer = %peer_addr, "accepted connection");
        let conn_handler = handler.clone();
        let conn_handle = handle.clone();
        let secret = config.secret.clone();
        let task = tokio::spawn(async move {
            connection_loop(stream, cid, secret, conn_handler, conn_handle).await;
        });
        let mut tasks = conn_tasks.lock().unwrap();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

#[derive(PartialEq)]
enum AuthState {
    Open,
    Pending,
    Granted,
    Refused,
}

async fn connection_loop(
    stream: TcpStream,
    cid: Cid,
    secret: Option<String>,
    handler: Arc<dyn FrameHandler>,
    handle: ServerHandle,
) {
    let (mut reader, writer) = stream.into_split();
    let queue = SendQueue::new(writer);
    let mut auth = if secret.is_some() {
        AuthState::Pending
    } else {
        AuthState::Open
    };

    loop {
        let body = match read_body(&mut reader).await {
            Ok(body) => body,
            Err(error) => {
                debug!(cid, %error, "connection closed");
                break;
            }
        };
        // a frame from a removed cid revives its registration
        handle.register(&cid, &queue);
        let frame = match Frame::from_slice(&body) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(cid, %error, "discarding malformed frame");
                continue;
            }
        };
        match auth {
            AuthState::Open => {}
            AuthState::Granted => {
                // the secret may be resent on reconnect bookkeeping; it is
                // control traffic either way
                if matches!(frame, Frame::Auth(_)) {
                    continue;
                }
            }
            AuthState::Pending => {
                match &frame {
                    Frame::Auth(token) if Some(token) == secret.as_ref() => {
                        auth = AuthState::Granted;
                    }
                    _ => {
                        warn!(cid, "peer failed authentication");
                        auth = AuthState::Refused;
                    }
                }
                continue;
            }
            AuthState::Refused => {
                warn!(cid, "dropping frame from unauthenticated peer");
                continue;
            }
        }
        if let Some(reply) = handler.on_frame(frame, &cid, &handle).await {
            handle.send(&cid, &reply);
        }
    }
    handle.remove(&cid);
}

/// Renders a connection counter as an opaque cid, base-36 upper-case.
fn encode_cid(mut n: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = [0u8; 7];
    let mut at = out.len();
    while n > 0 {
        at -= 1;
        out[at] = DIGITS[(n % 36) as usize];
        n /= 36;
    }
    String::from_utf8_lossy(&out[at..]).into_owned()
}
