//! Length-prefixed JSON framing over a byte pipe.
//!
//! Each frame is a 4-byte little-endian length followed by that many bytes
//! of JSON. This is the framing the engine speaks on its stdio pipes.

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::{Transport, TransportParts, TransportReceiver};
use crate::error::{Error, Result};

/// Frame writer half of a byte pipe.
pub struct PipeTransport<W> {
    writer: W,
}

impl<W> PipeTransport<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Builds transport parts over a write/read pair, typically the engine
    /// process's stdin and stdout.
    pub fn new<R>(writer: W, reader: R) -> TransportParts
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        TransportParts {
            sender: Box::new(Self { writer }),
            receiver: Box::new(PipeReceiver { reader, message_tx }),
            message_rx,
        }
    }
}

impl<W> Transport for PipeTransport<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let body = serde_json::to_vec(&message)?;
            let length = u32::try_from(body.len())
                .map_err(|_| Error::Transport(format!("frame too large: {} bytes", body.len())))?;
            self.writer.write_all(&length.to_le_bytes()).await?;
            self.writer.write_all(&body).await?;
            self.writer.flush().await?;
            Ok(())
        })
    }
}

struct PipeReceiver<R> {
    reader: R,
    message_tx: mpsc::UnboundedSender<Value>,
}

impl<R> TransportReceiver for PipeReceiver<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn run(mut self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let mut length = [0u8; 4];
            loop {
                match self.reader.read_exact(&mut length).await {
                    Ok(_) => {}
                    // EOF between frames is a clean shutdown.
                    Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                    Err(err) => return Err(err.into()),
                }

                let mut body = vec![0u8; u32::from_le_bytes(length) as usize];
                self.reader.read_exact(&mut body).await?;
                let message: Value = serde_json::from_slice(&body)?;
                if self.message_tx.send(message).is_err() {
                    // Dispatch loop is gone; nothing left to deliver to.
                    return Ok(());
                }
            }
        })
    }
}
