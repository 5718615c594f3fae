//! Proxy objects: the client-side stand-ins for engine-owned state.
//!
//! Every remote-backed entity is represented by a [`ProxyObject`] holding
//! identity, tree position, channel, and listener registry. Concrete types
//! wrap one by composition and expose their own typed operations:
//!
//! ```ignore
//! struct Page {
//!     core: ProxyObject,
//! }
//!
//! impl RemoteObject for Page {
//!     fn core(&self) -> &ProxyObject {
//!         &self.core
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use downcast_rs::{DowncastSync, impl_downcast};
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::channel::Channel;
use crate::connection::ConnectionLike;
use crate::error::{Error, Result};
use crate::events::{EventEmitter, EventPayload, Handler, ListenerId};

/// Why an object was disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeReason {
    /// The object was closed, by user code or by the engine.
    Closed,
    /// The engine garbage-collected the object.
    Collected,
}

/// What a proxy hangs off: another proxy, or the connection itself (root
/// only).
pub enum ObjectParent {
    Object(Arc<dyn RemoteObject>),
    Connection(Arc<dyn ConnectionLike>),
}

/// Implemented by every concrete proxy type.
///
/// The single required method hands out the shared [`ProxyObject`]; lifecycle,
/// identity and eventing all live there. `handle_event` is the hook the
/// dispatcher calls for protocol notifications addressed to the object;
/// override it to translate raw notifications before emitting.
pub trait RemoteObject: DowncastSync {
    fn core(&self) -> &ProxyObject;

    fn handle_event(&self, name: &str, payload: EventPayload) {
        self.core().emit(name, payload);
    }
}

impl_downcast!(sync RemoteObject);

impl std::fmt::Debug for dyn RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObject")
            .field("guid", &self.core().guid())
            .field("type_name", &self.core().type_name())
            .finish()
    }
}

/// Shared state of one remote-backed object.
pub struct ProxyObject {
    guid: Arc<str>,
    type_name: Arc<str>,
    parent: Mutex<Option<Weak<dyn RemoteObject>>>,
    connection: Arc<dyn ConnectionLike>,
    channel: Channel,
    initializer: Value,
    children: Mutex<HashMap<Arc<str>, Arc<dyn RemoteObject>>>,
    emitter: EventEmitter,
    subscriptions: Mutex<HashMap<String, String>>,
    disposed: Arc<AtomicBool>,
    was_collected: AtomicBool,
}

impl ProxyObject {
    /// Builds the shared core for a new proxy. Registration in the
    /// connection's registry and the parent's child set is the dispatcher's
    /// job, not the constructor's.
    pub fn new(
        parent: ObjectParent,
        type_name: impl Into<String>,
        guid: Arc<str>,
        initializer: Value,
    ) -> Self {
        let (connection, parent_weak) = match parent {
            ObjectParent::Object(parent) => {
                let connection = parent.core().connection();
                (connection, Some(Arc::downgrade(&parent)))
            }
            ObjectParent::Connection(connection) => (connection, None),
        };

        let type_name: Arc<str> = Arc::from(type_name.into());
        let disposed = Arc::new(AtomicBool::new(false));
        let channel = Channel::new(
            Arc::clone(&guid),
            Arc::clone(&type_name),
            Arc::clone(&connection),
            Arc::clone(&disposed),
        );

        Self {
            guid,
            type_name,
            parent: Mutex::new(parent_weak),
            connection,
            channel,
            initializer,
            children: Mutex::new(HashMap::new()),
            emitter: EventEmitter::new(),
            subscriptions: Mutex::new(HashMap::new()),
            disposed,
            was_collected: AtomicBool::new(false),
        }
    }

    /// The opaque identifier the engine knows this object by.
    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub(crate) fn guid_arc(&self) -> Arc<str> {
        Arc::clone(&self.guid)
    }

    /// The protocol type tag this object was created with.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The call facade bound to this object.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The structured snapshot received when the object was created.
    pub fn initializer(&self) -> &Value {
        &self.initializer
    }

    pub fn connection(&self) -> Arc<dyn ConnectionLike> {
        Arc::clone(&self.connection)
    }

    /// The current parent, if it is still alive.
    pub fn parent(&self) -> Option<Arc<dyn RemoteObject>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Snapshot of the current children.
    pub fn children(&self) -> Vec<Arc<dyn RemoteObject>> {
        self.children.lock().values().cloned().collect()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// True if the engine reported the object as garbage-collected.
    pub fn was_collected(&self) -> bool {
        self.was_collected.load(Ordering::SeqCst)
    }

    /// Declares which local events the engine must be told about. Events
    /// outside this map never produce subscription traffic.
    pub fn set_subscription_map(&self, map: HashMap<String, String>) {
        *self.subscriptions.lock() = map;
    }

    /// Registers a listener invoked on every emission of `event`. The first
    /// listener for a mapped event turns remote emission on.
    pub fn on<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: Fn(EventPayload) + Send + Sync + 'static,
    {
        self.add_listener(event, Arc::new(handler), false)
    }

    /// Registers a listener removed after its first invocation.
    pub fn once<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: Fn(EventPayload) + Send + Sync + 'static,
    {
        self.add_listener(event, Arc::new(handler), true)
    }

    fn add_listener(&self, event: &str, handler: Handler, once: bool) -> ListenerId {
        let (id, before) = self.emitter.add(event, handler, once);
        if before == 0 {
            self.update_subscription(event, true);
        }
        id
    }

    /// Removes a listener. Removing the last listener for a mapped event
    /// turns remote emission back off.
    pub fn remove_listener(&self, event: &str, id: ListenerId) {
        if self.emitter.remove(event, id) == Some(0) {
            self.update_subscription(event, false);
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.emitter.listener_count(event)
    }

    /// Synchronous fan-out to the current listeners.
    pub fn emit(&self, event: &str, payload: EventPayload) -> bool {
        self.emitter.emit(event, payload)
    }

    fn update_subscription(&self, event: &str, enabled: bool) {
        let Some(remote_event) = self.subscriptions.lock().get(event).cloned() else {
            return;
        };
        self.channel.send_no_reply_internal(
            "updateSubscription",
            json!({"event": remote_event, "enabled": enabled}),
        );
    }

    /// Unlinks this object from its parent and the registry, then disposes
    /// every child. Safe to call more than once; only the first call acts.
    pub fn dispose(&self, reason: DisposeReason) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if reason == DisposeReason::Collected {
            self.was_collected.store(true, Ordering::SeqCst);
        }

        if let Some(parent) = self.parent() {
            parent.core().remove_child(&self.guid);
        }
        self.connection.unregister_object(&self.guid);

        let children: Vec<_> = self.children.lock().values().cloned().collect();
        for child in children {
            child.core().dispose(reason);
        }
        self.children.lock().clear();

        tracing::debug!(guid = %self.guid, type_name = %self.type_name, ?reason, "disposed object");
    }

    /// Moves `child` under `parent`. The registry is untouched, so the child
    /// stays resolvable throughout; subscription state is not replayed.
    pub fn adopt(parent: &Arc<dyn RemoteObject>, child: &Arc<dyn RemoteObject>) {
        let old = child
            .core()
            .swap_parent(Some(Arc::downgrade(parent)));
        if let Some(old) = old.and_then(|weak| weak.upgrade()) {
            old.core().remove_child(child.core().guid());
        }
        parent.core().add_child(Arc::clone(child));
    }

    pub(crate) fn add_child(&self, child: Arc<dyn RemoteObject>) {
        let guid = child.core().guid_arc();
        self.children.lock().insert(guid, child);
    }

    pub(crate) fn remove_child(&self, guid: &str) {
        self.children.lock().remove(guid);
    }

    fn swap_parent(&self, parent: Option<Weak<dyn RemoteObject>>) -> Option<Weak<dyn RemoteObject>> {
        std::mem::replace(&mut *self.parent.lock(), parent)
    }
}

/// The guid-less object every connection starts with. All top-level objects
/// the engine creates are parented under it.
pub struct Root {
    core: ProxyObject,
}

impl RemoteObject for Root {
    fn core(&self) -> &ProxyObject {
        &self.core
    }
}

impl Root {
    pub(crate) fn new(connection: Arc<dyn ConnectionLike>) -> Self {
        Self {
            core: ProxyObject::new(
                ObjectParent::Connection(connection),
                "Root",
                Arc::from(""),
                json!({}),
            ),
        }
    }

    /// Performs the opening handshake and returns the primary remote object
    /// the engine hands back.
    pub async fn initialize(&self, sdk_language: &str) -> Result<Arc<dyn RemoteObject>> {
        let result = self
            .core
            .channel()
            .send_return_as_dict("initialize", json!({"sdkLanguage": sdk_language}))
            .await?;

        for value in result.values() {
            if let Some(guid) = value.get("guid").and_then(Value::as_str) {
                return self
                    .core
                    .connection()
                    .get_object(guid)
                    .ok_or_else(|| Error::ObjectNotFound(guid.to_string()));
            }
        }
        Err(Error::Protocol(
            "initialize reply carries no object reference".to_string(),
        ))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use futures_util::future::BoxFuture;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct SentMessage {
        pub guid: String,
        pub method: String,
        pub params: Value,
        pub internal: bool,
        pub no_reply: bool,
    }

    /// In-memory stand-in for a connection: records outbound traffic and
    /// answers every call with a canned reply.
    #[derive(Default)]
    pub(crate) struct StubConnection {
        objects: Mutex<HashMap<Arc<str>, Arc<dyn RemoteObject>>>,
        sent: Mutex<Vec<SentMessage>>,
        reply: Mutex<Value>,
    }

    impl StubConnection {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn sent(&self) -> Vec<SentMessage> {
            self.sent.lock().clone()
        }

        pub(crate) fn set_reply(&self, reply: Value) {
            *self.reply.lock() = reply;
        }
    }

    impl ConnectionLike for StubConnection {
        fn send_message(&self, guid: &str, method: &str, params: Value) -> BoxFuture<'_, Result<Value>> {
            self.sent.lock().push(SentMessage {
                guid: guid.to_string(),
                method: method.to_string(),
                params,
                internal: false,
                no_reply: false,
            });
            let reply = self.reply.lock().clone();
            Box::pin(async move { Ok(reply) })
        }

        fn send_message_no_reply(&self, guid: &str, method: &str, params: Value, internal: bool) {
            self.sent.lock().push(SentMessage {
                guid: guid.to_string(),
                method: method.to_string(),
                params,
                internal,
                no_reply: true,
            });
        }

        fn register_object(&self, object: Arc<dyn RemoteObject>) {
            self.objects
                .lock()
                .insert(object.core().guid_arc(), object);
        }

        fn unregister_object(&self, guid: &str) {
            self.objects.lock().remove(guid);
        }

        fn get_object(&self, guid: &str) -> Option<Arc<dyn RemoteObject>> {
            self.objects.lock().get(guid).cloned()
        }
    }

    pub(crate) struct TestObject {
        core: ProxyObject,
    }

    impl RemoteObject for TestObject {
        fn core(&self) -> &ProxyObject {
            &self.core
        }
    }

    /// Builds and registers a test proxy, attached under `parent` when given.
    pub(crate) fn new_object(
        connection: &Arc<StubConnection>,
        parent: Option<&Arc<dyn RemoteObject>>,
        type_name: &str,
        guid: &str,
    ) -> Arc<dyn RemoteObject> {
        let parent_ref = match parent {
            Some(parent) => ObjectParent::Object(Arc::clone(parent)),
            None => ObjectParent::Connection(Arc::clone(connection) as Arc<dyn ConnectionLike>),
        };
        let object: Arc<dyn RemoteObject> = Arc::new(TestObject {
            core: ProxyObject::new(parent_ref, type_name, Arc::from(guid), json!({})),
        });
        connection.register_object(Arc::clone(&object));
        if let Some(parent) = parent {
            parent.core().add_child(Arc::clone(&object));
        }
        object
    }
}
