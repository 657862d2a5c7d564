//! Wire frames for the hubmesh protocol.
//!
//! Every message on the wire is a JSON value preceded by a 4-byte
//! big-endian length prefix. Protocol frames are positional JSON arrays
//! (`["pub", topic, msg, from]`); the liveness probe is a bare number and
//! the authentication token is a bare string. This module is the single
//! encode/decode boundary between those positional arrays and the typed
//! [`Frame`] enum used everywhere else.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, TransportError};

/// Connection id: the broker's handle for one live peer.
pub type Cid = String;

/// Message id: correlates a call/locate request with its eventual reply.
pub type Mid = String;

/// Maximum accepted frame body size.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Options carried by a subscription request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubOpts {
    /// Ephemeral topic time-to-live in seconds. Ignored for non-ephemeral
    /// topics; `None` keeps the topic's previous (or the default) TTL.
    pub timeout: Option<u64>,
}

/// A single protocol frame.
///
/// The `cid` field of [`Frame::Call`] is positional on the wire: a node
/// sends the explicit target (empty string for "any handler"), and the
/// broker rewrites it to the calling peer's cid before delivery. Likewise
/// [`Frame::Pub`] gains its `from` field only on the broker-to-subscriber
/// leg.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Shared-secret token, sent as the first frame of a connection.
    Auth(String),
    /// Liveness probe: the sender's heartbeat seed.
    Heartbeat(u64),
    /// Register interest in publications on a topic.
    Sub {
        /// Topic being subscribed to.
        topic: String,
        /// Subscription options (ephemeral TTL).
        opts: SubOpts,
    },
    /// Publication.
    Pub {
        /// Topic being published to.
        topic: String,
        /// Published payload.
        msg: Value,
        /// Originating cid, filled in by the broker on delivery.
        from: Option<Cid>,
    },
    /// Request/response call routed through the handler table.
    Call {
        /// Topic identifying the handler.
        topic: String,
        /// Call payload.
        msg: Value,
        /// Target cid on the request leg (empty = broker picks); the
        /// caller's cid on the delivery leg.
        cid: Cid,
        /// Correlation id; empty for fire-and-forget directed sends.
        mid: Mid,
    },
    /// Reply to a call, correlated by mid.
    Repl {
        /// Reply payload.
        msg: Value,
        /// Correlation id of the originating call.
        mid: Mid,
    },
    /// Error delivered to a caller or forwarded to a target.
    Err {
        /// Error payload (normally a string).
        msg: Value,
        /// Cid the error concerns.
        target: Cid,
        /// Correlation id of the originating call.
        mid: Mid,
    },
    /// Register as a call handler for a topic.
    Handle {
        /// Topic the sender will serve calls for.
        topic: String,
    },
    /// Discovery query. Empty topic requests the whole tables.
    Locate {
        /// Topic to look up, or empty for everything.
        topic: String,
        /// Correlation id for the `Loc` reply.
        mid: Mid,
    },
    /// Discovery reply.
    Loc {
        /// Subscription table contents.
        subs: Value,
        /// Handler table contents.
        direct: Value,
        /// Correlation id of the originating `Locate`.
        mid: Mid,
    },
    /// Notice that the broker has marked the receiver dead.
    Dead {
        /// Human-readable reason.
        reason: String,
        /// Milliseconds of silence that triggered the eviction.
        elapsed_ms: u64,
    },
}

impl Frame {
    /// Encodes the frame as its on-wire JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            Frame::Auth(secret) => Value::String(secret.clone()),
            Frame::Heartbeat(seed) => json!(seed),
            Frame::Sub { topic, opts } => match opts.timeout {
                Some(secs) => json!(["sub", topic, { "timeout": secs }]),
                None => json!(["sub", topic, {}]),
            },
            Frame::Pub { topic, msg, from } => match from {
                Some(cid) => json!(["pub", topic, msg, cid]),
                None => json!(["pub", topic, msg]),
            },
            Frame::Call { topic, msg, cid, mid } => {
                json!(["call", topic, msg, cid, mid])
            }
            Frame::Repl { msg, mid } => json!(["repl", msg, mid]),
            Frame::Err { msg, target, mid } => json!(["err", msg, target, mid]),
            Frame::Handle { topic } => json!(["handle", topic]),
            Frame::Locate { topic, mid } => json!(["locate", topic, "", "", mid]),
            Frame::Loc { subs, direct, mid } => json!(["loc", subs, direct, mid]),
            Frame::Dead { reason, elapsed_ms } => json!(["dead", reason, elapsed_ms]),
        }
    }

    /// Decodes a frame from its on-wire JSON value.
    pub fn from_value(value: Value) -> Result<Frame> {
        match value {
            Value::Number(n) => {
                let seed = n
                    .as_u64()
                    .or_else(|| n.as_f64().map(|f| f as u64))
                    .ok_or_else(|| invalid("non-integer heartbeat"))?;
                Ok(Frame::Heartbeat(seed))
            }
            Value::String(s) => Ok(Frame::Auth(s)),
            Value::Array(arr) => Self::from_array(arr),
            other => Err(invalid(format!("unexpected frame shape: {other}"))),
        }
    }

    fn from_array(arr: Vec<Value>) -> Result<Frame> {
        let action = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing action tag"))?
            .to_string();
        let field = |idx: usize| arr.get(idx).cloned().unwrap_or(Value::Null);
        let text = |idx: usize| {
            arr.get(idx)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        match action.as_str() {
            "sub" => {
                let timeout = arr
                    .get(2)
                    .and_then(|v| v.get("timeout"))
                    .and_then(Value::as_u64);
                Ok(Frame::Sub {
                    topic: require_text(&arr, 1, "sub topic")?,
                    opts: SubOpts { timeout },
                })
            }
            "pub" => Ok(Frame::Pub {
                topic: require_text(&arr, 1, "pub topic")?,
                msg: field(2),
                from: arr.get(3).and_then(Value::as_str).map(str::to_string),
            }),
            "call" => Ok(Frame::Call {
                topic: require_text(&arr, 1, "call topic")?,
                msg: field(2),
                cid: text(3),
                mid: text(4),
            }),
            "repl" => Ok(Frame::Repl {
                msg: field(1),
                mid: require_text(&arr, 2, "repl mid")?,
            }),
            "err" => Ok(Frame::Err {
                msg: field(1),
                target: text(2),
                mid: text(3),
            }),
            "handle" => Ok(Frame::Handle {
                topic: require_text(&arr, 1, "handle topic")?,
            }),
            "locate" => Ok(Frame::Locate {
                topic: text(1),
                mid: require_text(&arr, 4, "locate mid")?,
            }),
            "loc" => Ok(Frame::Loc {
                subs: field(1),
                direct: field(2),
                mid: text(3),
            }),
            "dead" => Ok(Frame::Dead {
                reason: text(1),
                elapsed_ms: arr.get(2).and_then(Value::as_u64).unwrap_or(0),
            }),
            other => Err(invalid(format!("unknown action: {other}"))),
        }
    }

    /// Parses a frame from a raw JSON body.
    pub fn from_slice(body: &[u8]) -> Result<Frame> {
        let value: Value = serde_json::from_slice(body)?;
        Frame::from_value(value)
    }

    /// Encodes the frame with its length prefix, ready for the socket.
    pub fn encode(&self) -> Result<Bytes> {
        let body = serde_json::to_vec(&self.to_value())?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: body.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }
}

fn invalid(reason: impl Into<String>) -> TransportError {
    TransportError::InvalidFrame {
        reason: reason.into(),
    }
}

fn require_text(arr: &[Value], idx: usize, what: &str) -> Result<String> {
    arr.get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid(format!("missing {what}")))
}

/// Reads one length-prefixed frame body from the socket.
///
/// Only IO-level failures are reported here; JSON parsing is left to
/// [`Frame::from_slice`] so read loops can skip malformed frames without
/// dropping the connection.
pub async fn read_body<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut body = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut body).await?;
    }
    Ok(body)
}
