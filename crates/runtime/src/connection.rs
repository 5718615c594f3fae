//! Request/response correlation and frame dispatch.
//!
//! The [`Connection`] is the single source of truth for object identity and
//! the only reader and writer of the transport. Outbound calls get a fresh
//! correlation id and suspend their caller on a oneshot until the matching
//! response frame arrives. Inbound frames are processed strictly in arrival
//! order by one dispatch loop:
//!
//! 1. Response frames resolve or reject the pending call with their id.
//! 2. `__create__` / `__dispose__` / `__adopt__` frames mutate the object
//!    tree through the type registry.
//! 3. Anything else is an event, delivered to the target object after
//!    embedded object references are resolved against the registry.
//!
//! Desynchronization (a malformed frame, a response nobody asked for, a type
//! the registry does not know) is fatal: the connection tears down and every
//! outstanding call fails with the cause.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::events::EventPayload;
use crate::factory::TypeRegistry;
use crate::object::{DisposeReason, ObjectParent, ProxyObject, RemoteObject, Root};
use crate::transport::{Transport, TransportParts, TransportReceiver};

/// The slice of connection behavior proxy objects depend on.
///
/// Channels and proxies hold the connection as `Arc<dyn ConnectionLike>`,
/// which keeps them independent of the concrete transport plumbing and makes
/// them trivial to exercise against a stub.
pub trait ConnectionLike: Send + Sync {
    /// Sends a call on behalf of the object with `guid` and awaits its
    /// result.
    fn send_message(&self, guid: &str, method: &str, params: Value) -> BoxFuture<'_, Result<Value>>;

    /// Queues a call whose response is consumed silently; failures are
    /// logged, never surfaced.
    fn send_message_no_reply(&self, guid: &str, method: &str, params: Value, internal: bool);

    /// Adds an object to the registry.
    fn register_object(&self, object: Arc<dyn RemoteObject>);

    /// Removes an object from the registry.
    fn unregister_object(&self, guid: &str);

    /// Looks up a live object by guid.
    fn get_object(&self, guid: &str) -> Option<Arc<dyn RemoteObject>>;
}

/// Timing information attached to every outbound call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Unix timestamp in milliseconds.
    #[serde(rename = "wallTime")]
    pub wall_time: i64,
    /// Marks bookkeeping traffic (subscription toggles and the like).
    pub internal: bool,
}

impl Metadata {
    pub fn new(internal: bool) -> Self {
        let wall_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0);
        Self { wall_time, internal }
    }
}

/// Outbound call frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id linking the eventual response back to the caller.
    pub id: u32,
    /// Guid of the target object; empty for the root.
    pub guid: String,
    pub method: String,
    pub params: Value,
    pub metadata: Metadata,
}

/// Inbound response frame, correlated by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// Error envelope used both in responses and binding rejections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub error: RemoteError,
}

/// Structured failure reported across the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Inbound notification frame: an event or a lifecycle message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Guid of the addressed object.
    pub guid: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// One decoded inbound frame. Frames that fit neither variant are malformed,
/// which is fatal to the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Response(Response),
    Event(Event),
}

enum PendingCall {
    /// A caller is suspended on the responder.
    Call {
        method: String,
        responder: oneshot::Sender<Result<Value>>,
    },
    /// Fire-and-forget; the response is consumed, errors only logged.
    NoReply { method: String },
}

/// Correlation layer and dispatch loop over one transport.
pub struct Connection {
    last_id: AtomicU32,
    callbacks: Mutex<HashMap<u32, PendingCall>>,
    outbound_tx: mpsc::UnboundedSender<Value>,
    transport_sender: Mutex<Option<Box<dyn Transport>>>,
    transport_receiver: Mutex<Option<Box<dyn TransportReceiver>>>,
    message_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    objects: Mutex<HashMap<Arc<str>, Arc<dyn RemoteObject>>>,
    registry: TypeRegistry,
    closed: Mutex<Option<String>>,
    root: Mutex<Option<Arc<Root>>>,
}

impl Connection {
    /// Builds a connection over the given transport. The registry decides
    /// which `__create__` types the connection understands.
    ///
    /// The root object is registered immediately; call
    /// [`run`](Self::run) to start dispatching.
    pub fn new(parts: TransportParts, registry: TypeRegistry) -> Arc<Self> {
        let TransportParts {
            sender,
            receiver,
            message_rx,
        } = parts;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let connection = Arc::new(Self {
            last_id: AtomicU32::new(0),
            callbacks: Mutex::new(HashMap::new()),
            outbound_tx,
            transport_sender: Mutex::new(Some(sender)),
            transport_receiver: Mutex::new(Some(receiver)),
            message_rx: Mutex::new(Some(message_rx)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            objects: Mutex::new(HashMap::new()),
            registry,
            closed: Mutex::new(None),
            root: Mutex::new(None),
        });

        let root = Arc::new(Root::new(
            Arc::clone(&connection) as Arc<dyn ConnectionLike>
        ));
        connection.register_object(Arc::clone(&root) as Arc<dyn RemoteObject>);
        *connection.root.lock() = Some(root);
        connection
    }

    /// The guid-less object the engine parents top-level objects under.
    pub fn root(&self) -> Arc<Root> {
        self.root
            .lock()
            .clone()
            .expect("root is created with the connection")
    }

    /// True once the connection has torn down, for any reason.
    pub fn is_closed(&self) -> bool {
        self.closed.lock().is_some()
    }

    /// Tears the connection down from the client side, failing every
    /// outstanding call.
    pub fn close(&self) {
        self.teardown("connection closed by client".to_string());
    }

    /// Sends a call and suspends until its response arrives or the
    /// connection tears down.
    pub async fn send_message(&self, guid: &str, method: &str, params: Value) -> Result<Value> {
        if let Some(cause) = self.closed.lock().clone() {
            return Err(Error::ConnectionClosed(cause));
        }

        let id = self.last_id.fetch_add(1, Ordering::SeqCst);
        let (responder, receiver) = oneshot::channel();
        self.callbacks.lock().insert(
            id,
            PendingCall::Call {
                method: method.to_string(),
                responder,
            },
        );

        tracing::debug!(id, guid, method, "sending message");
        if let Err(err) = self.enqueue(Request {
            id,
            guid: guid.to_string(),
            method: method.to_string(),
            params,
            metadata: Metadata::new(false),
        }) {
            self.callbacks.lock().remove(&id);
            return Err(err);
        }

        // Teardown may have drained the callbacks between the closed check
        // and our insert; reclaim the entry ourselves in that case.
        if let Some(cause) = self.closed.lock().clone() {
            if self.callbacks.lock().remove(&id).is_some() {
                return Err(Error::ConnectionClosed(cause));
            }
        }

        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => {
                let cause = self
                    .closed
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "connection torn down".to_string());
                Err(Error::ConnectionClosed(cause))
            }
        }
    }

    /// Queues a call without a waiting caller. The response is still
    /// correlated so it cannot be mistaken for desynchronization; an error
    /// outcome is logged and dropped.
    pub fn send_message_no_reply(&self, guid: &str, method: &str, params: Value, internal: bool) {
        if self.closed.lock().is_some() {
            tracing::debug!(guid, method, "dropping notification on closed connection");
            return;
        }

        let id = self.last_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks.lock().insert(
            id,
            PendingCall::NoReply {
                method: method.to_string(),
            },
        );
        if let Err(err) = self.enqueue(Request {
            id,
            guid: guid.to_string(),
            method: method.to_string(),
            params,
            metadata: Metadata::new(internal),
        }) {
            tracing::warn!(guid, method, %err, "failed to queue notification");
            self.callbacks.lock().remove(&id);
        }
    }

    fn enqueue(&self, request: Request) -> Result<()> {
        let frame = serde_json::to_value(&request)?;
        self.outbound_tx
            .send(frame)
            .map_err(|_| Error::ConnectionClosed("outbound channel closed".to_string()))
    }

    /// Runs the dispatch loop until the transport ends or a protocol error
    /// kills the connection. May be called once.
    pub async fn run(&self) {
        let receiver = self
            .transport_receiver
            .lock()
            .take()
            .expect("run() can only be called once");
        let mut sender = self
            .transport_sender
            .lock()
            .take()
            .expect("run() can only be called once");
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .take()
            .expect("run() can only be called once");
        let mut message_rx = self
            .message_rx
            .lock()
            .take()
            .expect("run() can only be called once");

        let reader = tokio::spawn(async move {
            if let Err(err) = receiver.run().await {
                tracing::error!(%err, "transport receiver failed");
            }
        });
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(err) = sender.send(frame).await {
                    tracing::error!(%err, "transport write failed");
                    break;
                }
            }
        });

        while let Some(raw) = message_rx.recv().await {
            let message = match serde_json::from_value::<Message>(raw) {
                Ok(message) => message,
                Err(err) => {
                    self.teardown(format!("malformed frame: {err}"));
                    break;
                }
            };
            if let Err(err) = self.dispatch(message) {
                self.teardown(err.to_string());
                break;
            }
        }

        self.teardown("connection closed".to_string());
        reader.abort();
        writer.abort();
        let _ = reader.await;
        let _ = writer.await;
    }

    /// Processes one frame. An error return means desynchronization and is
    /// fatal to the connection.
    fn dispatch(&self, message: Message) -> Result<()> {
        match message {
            Message::Response(response) => {
                let pending = self.callbacks.lock().remove(&response.id).ok_or_else(|| {
                    Error::Protocol(format!("no pending call for response id {}", response.id))
                })?;

                let outcome = match response.error {
                    Some(wrapper) => Err(remote_error(wrapper.error)),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };

                match pending {
                    PendingCall::Call { responder, .. } => {
                        // The caller may have lost interest; that is fine.
                        let _ = responder.send(outcome);
                    }
                    PendingCall::NoReply { method } => {
                        if let Err(err) = outcome {
                            tracing::warn!(%method, %err, "notification failed");
                        }
                    }
                }
                Ok(())
            }
            Message::Event(event) => match event.method.as_str() {
                "__create__" => self.handle_create(&event),
                "__dispose__" => self.handle_dispose(&event),
                "__adopt__" => self.handle_adopt(&event),
                _ => {
                    match self.get_object(&event.guid) {
                        Some(object) => {
                            let payload = self.rehydrate(event.params);
                            object.handle_event(&event.method, payload);
                        }
                        None => {
                            // Benign: the engine raced our local dispose.
                            tracing::debug!(
                                guid = %event.guid,
                                method = %event.method,
                                "event for unknown object ignored"
                            );
                        }
                    }
                    Ok(())
                }
            },
        }
    }

    fn handle_create(&self, event: &Event) -> Result<()> {
        let type_name = event
            .params
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("__create__ missing 'type'".to_string()))?;
        let guid: Arc<str> = Arc::from(
            event
                .params
                .get("guid")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Protocol("__create__ missing 'guid'".to_string()))?,
        );
        let initializer = event
            .params
            .get("initializer")
            .cloned()
            .unwrap_or(Value::Null);

        let parent = self.get_object(&event.guid).ok_or_else(|| {
            Error::Protocol(format!("parent object not found: '{}'", event.guid))
        })?;

        let object = self.registry.create(
            ObjectParent::Object(Arc::clone(&parent)),
            type_name,
            Arc::clone(&guid),
            initializer,
        )?;
        self.register_object(Arc::clone(&object));
        parent.core().add_child(object);

        tracing::debug!(type_name, guid = %guid, parent = %event.guid, "created object");
        Ok(())
    }

    fn handle_dispose(&self, event: &Event) -> Result<()> {
        let reason = match event.params.get("reason").and_then(Value::as_str) {
            Some("gc") => DisposeReason::Collected,
            _ => DisposeReason::Closed,
        };
        match self.get_object(&event.guid) {
            Some(object) => object.core().dispose(reason),
            None => tracing::debug!(guid = %event.guid, "dispose for unknown object ignored"),
        }
        Ok(())
    }

    fn handle_adopt(&self, event: &Event) -> Result<()> {
        let child_guid = event
            .params
            .get("guid")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("__adopt__ missing 'guid'".to_string()))?;

        let parent = self.get_object(&event.guid).ok_or_else(|| {
            Error::Protocol(format!("adopting parent not found: '{}'", event.guid))
        })?;
        let child = self
            .get_object(child_guid)
            .ok_or_else(|| Error::Protocol(format!("adopted child not found: '{child_guid}'")))?;

        ProxyObject::adopt(&parent, &child);
        tracing::debug!(child = child_guid, parent = %event.guid, "adopted object");
        Ok(())
    }

    /// Resolves every `{"guid": ...}` reference inside `params` against the
    /// registry and bundles the hits next to the raw parameters.
    fn rehydrate(&self, params: Value) -> EventPayload {
        let mut objects = HashMap::new();
        self.collect_references(&params, &mut objects);
        EventPayload::new(params, objects)
    }

    fn collect_references(
        &self,
        value: &Value,
        objects: &mut HashMap<Arc<str>, Arc<dyn RemoteObject>>,
    ) {
        match value {
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(Value::String(guid)) = map.get("guid") {
                        match self.get_object(guid) {
                            Some(object) => {
                                objects.insert(object.core().guid_arc(), object);
                            }
                            None => {
                                tracing::debug!(guid = %guid, "unresolvable reference in payload")
                            }
                        }
                        return;
                    }
                }
                for nested in map.values() {
                    self.collect_references(nested, objects);
                }
            }
            Value::Array(items) => {
                for nested in items {
                    self.collect_references(nested, objects);
                }
            }
            _ => {}
        }
    }

    /// Marks the connection closed and fails every outstanding call with the
    /// cause. Only the first call acts.
    fn teardown(&self, cause: String) {
        {
            let mut closed = self.closed.lock();
            if closed.is_some() {
                return;
            }
            *closed = Some(cause.clone());
        }

        let pending: Vec<PendingCall> = self.callbacks.lock().drain().map(|(_, p)| p).collect();
        for call in pending {
            match call {
                PendingCall::Call { method, responder } => {
                    tracing::debug!(%method, cause = %cause, "failing outstanding call");
                    let _ = responder.send(Err(Error::ConnectionClosed(cause.clone())));
                }
                PendingCall::NoReply { .. } => {}
            }
        }
    }

    /// Looks up a live object by guid.
    pub fn get_object(&self, guid: &str) -> Option<Arc<dyn RemoteObject>> {
        self.objects.lock().get(guid).cloned()
    }

    fn register_object(&self, object: Arc<dyn RemoteObject>) {
        self.objects
            .lock()
            .insert(object.core().guid_arc(), object);
    }
}

impl ConnectionLike for Connection {
    fn send_message(&self, guid: &str, method: &str, params: Value) -> BoxFuture<'_, Result<Value>> {
        let guid = guid.to_string();
        let method = method.to_string();
        Box::pin(async move { Connection::send_message(self, &guid, &method, params).await })
    }

    fn send_message_no_reply(&self, guid: &str, method: &str, params: Value, internal: bool) {
        Connection::send_message_no_reply(self, guid, method, params, internal);
    }

    fn register_object(&self, object: Arc<dyn RemoteObject>) {
        Connection::register_object(self, object);
    }

    fn unregister_object(&self, guid: &str) {
        self.objects.lock().remove(guid);
    }

    fn get_object(&self, guid: &str) -> Option<Arc<dyn RemoteObject>> {
        Connection::get_object(self, guid)
    }
}

fn remote_error(error: RemoteError) -> Error {
    Error::Remote {
        name: error.name.unwrap_or_else(|| "Error".to_string()),
        message: error.message,
        stack: error.stack,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::transport::PipeTransport;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf, duplex};
    use tokio::task::JoinHandle;

    /// The engine's side of an in-memory pipe: reads the client's frames,
    /// injects its own.
    pub(crate) struct EngineHarness {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        #[allow(dead_code)]
        run: JoinHandle<()>,
    }

    impl EngineHarness {
        pub(crate) async fn recv_frame(&mut self) -> Value {
            tokio::time::timeout(Duration::from_secs(5), async {
                let mut len = [0u8; 4];
                self.reader.read_exact(&mut len).await.expect("frame length");
                let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
                self.reader.read_exact(&mut body).await.expect("frame body");
                serde_json::from_slice(&body).expect("frame json")
            })
            .await
            .expect("timed out waiting for an outbound frame")
        }

        pub(crate) async fn send_frame(&mut self, frame: Value) {
            let body = serde_json::to_vec(&frame).unwrap();
            self.writer
                .write_all(&(body.len() as u32).to_le_bytes())
                .await
                .unwrap();
            self.writer.write_all(&body).await.unwrap();
        }
    }

    pub(crate) struct Widget {
        core: ProxyObject,
    }

    impl RemoteObject for Widget {
        fn core(&self) -> &ProxyObject {
            &self.core
        }
    }

    pub(crate) fn widget_registry() -> TypeRegistry {
        let mut registry = TypeRegistry::default();
        registry.register("Widget", |parent, type_name, guid, initializer| {
            Ok(Arc::new(Widget {
                core: ProxyObject::new(parent, type_name, guid, initializer),
            }) as Arc<dyn RemoteObject>)
        });
        registry
    }

    pub(crate) fn connection() -> (Arc<Connection>, EngineHarness) {
        connection_with(widget_registry())
    }

    pub(crate) fn connection_with(registry: TypeRegistry) -> (Arc<Connection>, EngineHarness) {
        let (client, engine) = duplex(1 << 16);
        let (client_read, client_write) = tokio::io::split(client);
        let parts = PipeTransport::new(client_write, client_read);
        let connection = Connection::new(parts, registry);
        let run = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move { connection.run().await }
        });
        let (engine_read, engine_write) = tokio::io::split(engine);
        (
            connection,
            EngineHarness {
                reader: engine_read,
                writer: engine_write,
                run,
            },
        )
    }

    pub(crate) fn create_frame(parent: &str, type_name: &str, guid: &str, initializer: Value) -> Value {
        json!({
            "guid": parent,
            "method": "__create__",
            "params": {"type": type_name, "guid": guid, "initializer": initializer},
        })
    }

    /// Completes one full call round trip. Because dispatch is in-order,
    /// every frame injected before this returns has been processed.
    pub(crate) async fn roundtrip(connection: &Arc<Connection>, engine: &mut EngineHarness) {
        let call = tokio::spawn({
            let connection = Arc::clone(connection);
            async move { connection.send_message("", "ping", json!({})).await }
        });
        let frame = engine.recv_frame().await;
        assert_eq!(frame["method"], "ping");
        engine
            .send_frame(json!({"id": frame["id"], "result": null}))
            .await;
        call.await.unwrap().unwrap();
    }

    pub(crate) async fn wait_closed(connection: &Connection) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !connection.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection did not tear down");
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn request_ids_are_sequential() {
        let (connection, mut engine) = connection();

        for expected in 0..3u32 {
            let call = tokio::spawn({
                let connection = Arc::clone(&connection);
                async move { connection.send_message("", "ping", json!({})).await }
            });
            let frame = engine.recv_frame().await;
            assert_eq!(frame["id"], expected);
            engine
                .send_frame(json!({"id": frame["id"], "result": null}))
                .await;
            call.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn response_resolves_the_call_that_produced_it() {
        let (connection, mut engine) = connection();

        let call = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move { connection.send_message("", "status", json!({"q": 1})).await }
        });

        let frame = engine.recv_frame().await;
        assert_eq!(frame["guid"], "");
        assert_eq!(frame["method"], "status");
        assert_eq!(frame["params"]["q"], 1);
        assert!(frame["metadata"]["wallTime"].is_i64());
        assert_eq!(frame["metadata"]["internal"], false);

        engine
            .send_frame(json!({"id": frame["id"], "result": {"ok": true}}))
            .await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn remote_errors_surface_only_to_their_caller() {
        let (connection, mut engine) = connection();

        let call = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move { connection.send_message("", "navigate", json!({})).await }
        });

        let frame = engine.recv_frame().await;
        engine
            .send_frame(json!({
                "id": frame["id"],
                "error": {"error": {"message": "navigation timeout", "name": "TimeoutError"}},
            }))
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.error_name(), Some("TimeoutError"));

        // Not fatal: the connection keeps serving calls.
        roundtrip(&connection, &mut engine).await;
    }

    #[tokio::test]
    async fn unrelated_events_are_delivered_first_in_frame_order() {
        let (connection, mut engine) = connection();
        engine
            .send_frame(create_frame("", "Widget", "w-1", json!({})))
            .await;
        roundtrip(&connection, &mut engine).await;

        let widget = connection.get_object("w-1").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        widget.core().on("signal", move |_| sink.lock().push("event"));

        let call = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move { connection.send_message("", "foo", json!({})).await }
        });
        let frame = engine.recv_frame().await;

        engine
            .send_frame(json!({"guid": "w-1", "method": "signal", "params": {}}))
            .await;
        engine
            .send_frame(json!({"id": frame["id"], "result": {"done": true}}))
            .await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["done"], true);
        assert_eq!(*log.lock(), vec!["event"]);
    }

    #[tokio::test]
    async fn unknown_response_id_is_fatal() {
        let (connection, mut engine) = connection();

        let call = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move { connection.send_message("", "ping", json!({})).await }
        });
        let _ = engine.recv_frame().await;

        engine.send_frame(json!({"id": 999, "result": null})).await;

        let err = call.await.unwrap().unwrap_err();
        match err {
            Error::ConnectionClosed(cause) => assert!(cause.contains("no pending call")),
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }

        let err = connection.send_message("", "ping", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn malformed_frames_are_fatal() {
        let (connection, mut engine) = connection();
        engine.send_frame(json!({"nonsense": true})).await;
        wait_closed(&connection).await;

        let err = connection.send_message("", "ping", json!({})).await.unwrap_err();
        match err {
            Error::ConnectionClosed(cause) => assert!(cause.contains("malformed frame")),
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_builds_registers_and_attaches() {
        let (connection, mut engine) = connection();
        engine
            .send_frame(create_frame("", "Widget", "w-1", json!({"title": "main"})))
            .await;
        roundtrip(&connection, &mut engine).await;

        let widget = connection.get_object("w-1").unwrap();
        assert_eq!(widget.core().type_name(), "Widget");
        assert_eq!(widget.core().initializer()["title"], "main");
        let parent = widget.core().parent().unwrap();
        assert_eq!(parent.core().guid(), "");
        assert_eq!(connection.root().core().children().len(), 1);
    }

    #[tokio::test]
    async fn create_with_unknown_type_is_fatal() {
        let (connection, mut engine) = connection();
        engine
            .send_frame(create_frame("", "Mystery", "m-1", json!({})))
            .await;
        wait_closed(&connection).await;

        let err = connection.send_message("", "ping", json!({})).await.unwrap_err();
        match err {
            Error::ConnectionClosed(cause) => assert!(cause.contains("unknown object type")),
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispose_frame_cascades_and_clears_the_registry() {
        let (connection, mut engine) = connection();
        engine
            .send_frame(create_frame("", "Widget", "w-1", json!({})))
            .await;
        engine
            .send_frame(create_frame("w-1", "Widget", "w-2", json!({})))
            .await;
        roundtrip(&connection, &mut engine).await;

        let parent = connection.get_object("w-1").unwrap();
        let child = connection.get_object("w-2").unwrap();

        engine
            .send_frame(json!({"guid": "w-1", "method": "__dispose__", "params": {"reason": "gc"}}))
            .await;
        roundtrip(&connection, &mut engine).await;

        assert!(connection.get_object("w-1").is_none());
        assert!(connection.get_object("w-2").is_none());
        assert!(parent.core().was_collected());
        assert!(child.core().is_disposed());
        assert!(connection.root().core().children().is_empty());
    }

    #[tokio::test]
    async fn adopt_frame_reparents_atomically() {
        let (connection, mut engine) = connection();
        engine
            .send_frame(create_frame("", "Widget", "w-1", json!({})))
            .await;
        engine
            .send_frame(create_frame("", "Widget", "w-2", json!({})))
            .await;
        engine
            .send_frame(create_frame("w-1", "Widget", "w-3", json!({})))
            .await;
        engine
            .send_frame(json!({"guid": "w-2", "method": "__adopt__", "params": {"guid": "w-3"}}))
            .await;
        roundtrip(&connection, &mut engine).await;

        let child = connection.get_object("w-3").unwrap();
        assert_eq!(child.core().parent().unwrap().core().guid(), "w-2");
        assert!(connection.get_object("w-1").unwrap().core().children().is_empty());
        assert_eq!(connection.get_object("w-2").unwrap().core().children().len(), 1);
    }

    #[tokio::test]
    async fn event_references_are_rehydrated() {
        let (connection, mut engine) = connection();
        engine
            .send_frame(create_frame("", "Widget", "w-1", json!({})))
            .await;
        engine
            .send_frame(create_frame("", "Widget", "w-2", json!({})))
            .await;
        roundtrip(&connection, &mut engine).await;

        let widget = connection.get_object("w-1").unwrap();
        let payloads = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&payloads);
        widget.core().on("popup", move |payload| sink.lock().push(payload));

        engine
            .send_frame(json!({
                "guid": "w-1",
                "method": "popup",
                "params": {"page": {"guid": "w-2"}, "n": 5},
            }))
            .await;
        roundtrip(&connection, &mut engine).await;

        let payloads = payloads.lock();
        assert_eq!(payloads.len(), 1);
        let page = payloads[0].object("page").unwrap();
        assert_eq!(page.core().guid(), "w-2");
        assert_eq!(payloads[0].get("n").and_then(Value::as_i64), Some(5));
    }

    #[tokio::test]
    async fn events_for_unknown_objects_are_ignored() {
        let (connection, mut engine) = connection();
        engine
            .send_frame(json!({"guid": "ghost", "method": "boo", "params": {}}))
            .await;
        // Still alive and serving.
        roundtrip(&connection, &mut engine).await;
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn transport_eof_fails_every_outstanding_call() {
        let (connection, mut engine) = connection();

        let first = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move { connection.send_message("", "a", json!({})).await }
        });
        let second = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move { connection.send_message("", "b", json!({})).await }
        });
        let _ = engine.recv_frame().await;
        let _ = engine.recv_frame().await;

        drop(engine);

        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(_)));
        let err = second.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn close_fails_new_calls_without_a_round_trip() {
        let (connection, _engine) = connection();
        connection.close();
        let err = connection.send_message("", "ping", json!({})).await.unwrap_err();
        match err {
            Error::ConnectionClosed(cause) => assert!(cause.contains("closed by client")),
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_reply_failures_are_logged_not_raised() {
        let (connection, mut engine) = connection();

        connection
            .root()
            .core()
            .channel()
            .send_no_reply("notify", json!({"k": 1}));

        let frame = engine.recv_frame().await;
        assert_eq!(frame["method"], "notify");
        engine
            .send_frame(json!({
                "id": frame["id"],
                "error": {"error": {"message": "nobody cares"}},
            }))
            .await;

        // The error is consumed silently; the connection keeps working.
        roundtrip(&connection, &mut engine).await;
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn initialize_returns_the_primary_object() {
        let (connection, mut engine) = connection();
        engine
            .send_frame(create_frame("", "Widget", "w-1", json!({})))
            .await;

        let call = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move { connection.root().initialize("rust").await }
        });

        let frame = engine.recv_frame().await;
        assert_eq!(frame["method"], "initialize");
        assert_eq!(frame["params"]["sdkLanguage"], "rust");
        engine
            .send_frame(json!({"id": frame["id"], "result": {"primary": {"guid": "w-1"}}}))
            .await;

        let primary = call.await.unwrap().unwrap();
        assert_eq!(primary.core().guid(), "w-1");
        assert_eq!(primary.core().type_name(), "Widget");
    }

    #[test]
    fn message_deserialization_distinguishes_responses_and_events() {
        let message: Message =
            serde_json::from_str(r#"{"id": 42, "result": {"status": "ok"}}"#).unwrap();
        assert!(matches!(message, Message::Response(ref r) if r.id == 42));

        let message: Message =
            serde_json::from_str(r#"{"guid": "w-1", "method": "console", "params": {"text": "hi"}}"#)
                .unwrap();
        match message {
            Message::Event(event) => {
                assert_eq!(event.guid, "w-1");
                assert_eq!(event.method, "console");
                assert_eq!(event.params["text"], "hi");
            }
            other => panic!("expected Event, got {other:?}"),
        }

        // No params is still a valid event frame.
        let message: Message =
            serde_json::from_str(r#"{"guid": "w-1", "method": "closed"}"#).unwrap();
        assert!(matches!(message, Message::Event(_)));

        assert!(serde_json::from_str::<Message>(r#"{"nonsense": true}"#).is_err());
    }

    #[test]
    fn remote_error_parsing_keeps_name_and_stack() {
        let err = remote_error(RemoteError {
            message: "timeout".to_string(),
            name: Some("TimeoutError".to_string()),
            stack: Some("at foo".to_string()),
        });
        assert!(err.is_timeout());
        assert_eq!(err.error_name(), Some("TimeoutError"));
        assert_eq!(err.stack_trace(), Some("at foo"));

        let err = remote_error(RemoteError {
            message: "boom".to_string(),
            name: None,
            stack: None,
        });
        assert_eq!(err.error_name(), Some("Error"));
    }
}
