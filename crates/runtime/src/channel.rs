//! Per-object call facade.
//!
//! Every proxy object owns a [`Channel`] bound to its guid. The channel is
//! the only way user code reaches the wire: it funnels method calls into the
//! connection's correlation machinery and short-circuits calls through
//! disposed proxies without a round trip.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Map, Value};

use crate::connection::ConnectionLike;
use crate::error::{Error, Result};

/// Call surface for one proxy object.
#[derive(Clone)]
pub struct Channel {
    guid: Arc<str>,
    type_name: Arc<str>,
    connection: Arc<dyn ConnectionLike>,
    disposed: Arc<AtomicBool>,
}

impl Channel {
    pub(crate) fn new(
        guid: Arc<str>,
        type_name: Arc<str>,
        connection: Arc<dyn ConnectionLike>,
        disposed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            guid,
            type_name,
            connection,
            disposed,
        }
    }

    /// The guid of the object this channel speaks for.
    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Sends a method call and awaits the engine's result.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.ensure_live()?;
        self.connection.send_message(&self.guid, method, params).await
    }

    /// Sends a method call and flattens the result into a named-field map.
    ///
    /// A `null` result becomes an empty map; a non-object result is a
    /// protocol error.
    pub async fn send_return_as_dict(&self, method: &str, params: Value) -> Result<Map<String, Value>> {
        match self.send(method, params).await? {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            other => Err(Error::Protocol(format!(
                "expected object result for '{method}', got {other}"
            ))),
        }
    }

    /// Sends a method call without waiting for the response. Failures are
    /// logged by the dispatcher, never surfaced.
    pub fn send_no_reply(&self, method: &str, params: Value) {
        self.no_reply(method, params, false);
    }

    /// Like [`send_no_reply`](Self::send_no_reply), but marks the call as
    /// internal bookkeeping (subscription toggles and the like).
    pub(crate) fn send_no_reply_internal(&self, method: &str, params: Value) {
        self.no_reply(method, params, true);
    }

    fn no_reply(&self, method: &str, params: Value, internal: bool) {
        if self.disposed.load(Ordering::SeqCst) {
            tracing::debug!(guid = %self.guid, method, "dropping notification for disposed object");
            return;
        }
        self.connection
            .send_message_no_reply(&self.guid, method, params, internal);
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::ObjectDisposed {
                type_name: self.type_name.to_string(),
                guid: self.guid.to_string(),
            });
        }
        Ok(())
    }
}
