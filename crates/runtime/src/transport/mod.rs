//! Message-boundary transports.
//!
//! The dispatch layer consumes whole parsed frames in order; everything
//! below that boundary lives here. A transport is split three ways so the
//! connection can own each half independently:
//!
//! - [`Transport`]: writes one outbound frame at a time.
//! - [`TransportReceiver`]: pumps decoded inbound frames into a channel
//!   until the stream ends or framing breaks.
//! - `message_rx`: the channel the dispatch loop reads from.
//!
//! Two framings are provided: length-prefixed JSON over a byte pipe
//! ([`pipe::PipeTransport`], used for engine stdio) and JSON text frames
//! over WebSocket ([`websocket`]).

pub mod pipe;
pub mod websocket;


use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

pub use pipe::PipeTransport;
pub use websocket::WebSocketTransport;

/// Writes whole frames to the engine.
pub trait Transport: Send {
    fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>>;
}

/// Reads and decodes frames from the engine, forwarding them in order.
///
/// `run` returns `Ok` on clean end-of-stream and `Err` when the framing is
/// violated; either way the message channel closes, which the dispatch loop
/// treats as teardown.
pub trait TransportReceiver: Send {
    fn run(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

/// The three halves a [`Connection`](crate::Connection) takes ownership of.
pub struct TransportParts {
    pub sender: Box<dyn Transport>,
    pub receiver: Box<dyn TransportReceiver>,
    pub message_rx: mpsc::UnboundedReceiver<Value>,
}

impl std::fmt::Debug for TransportParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportParts").finish_non_exhaustive()
    }
}
