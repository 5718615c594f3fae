//! JSON text frames over WebSocket.
//!
//! Used when the engine exposes its protocol endpoint over a WebSocket
//! instead of stdio pipes. Each protocol frame is one text message; ping,
//! pong and binary frames are not protocol traffic and are skipped.

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::{Transport, TransportParts, TransportReceiver};
use crate::error::{Error, Result};

/// Frame writer half of a WebSocket.
pub struct WebSocketTransport<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an already-established WebSocket into transport parts.
    pub fn new(stream: WebSocketStream<S>) -> TransportParts {
        let (sink, stream) = stream.split();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        TransportParts {
            sender: Box::new(Self { sink }),
            receiver: Box::new(WebSocketReceiver { stream, message_tx }),
            message_rx,
        }
    }
}

/// Dials the engine's WebSocket endpoint.
pub async fn connect(url: &str) -> Result<TransportParts> {
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|err| Error::Transport(err.to_string()))?;
    Ok(WebSocketTransport::new(stream))
}

impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let text = serde_json::to_string(&message)?;
            self.sink
                .send(WsMessage::Text(text))
                .await
                .map_err(|err| Error::Transport(err.to_string()))
        })
    }
}

struct WebSocketReceiver<S> {
    stream: SplitStream<WebSocketStream<S>>,
    message_tx: mpsc::UnboundedSender<Value>,
}

impl<S> TransportReceiver for WebSocketReceiver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn run(mut self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            while let Some(frame) = self.stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        let message: Value = serde_json::from_str(&text)?;
                        if self.message_tx.send(message).is_err() {
                            return Ok(());
                        }
                    }
                    Ok(WsMessage::Close(_)) => return Ok(()),
                    Ok(_) => {}
                    Err(err) => return Err(Error::Transport(err.to_string())),
                }
            }
            Ok(())
        })
    }
}
