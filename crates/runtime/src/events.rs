//! Listener registry and event payloads.
//!
//! Every proxy object carries an [`EventEmitter`]: a name-keyed table of
//! multi-use and one-shot listeners with synchronous fan-out. Notifications
//! arrive as an [`EventPayload`], the raw parameters plus any live objects
//! the dispatcher resolved out of them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::object::RemoteObject;

/// Identifies one listener registration for later removal.
pub type ListenerId = u64;

pub(crate) type Handler = Arc<dyn Fn(EventPayload) + Send + Sync>;

/// Parameters of one event, with embedded object references resolved.
///
/// The wire encodes references to live objects as `{"guid": ...}` values
/// inside the parameters. The dispatcher looks those up in the registry
/// before delivery; [`EventPayload::object`] returns the resolved proxy for
/// a given parameter key.
#[derive(Clone, Default)]
pub struct EventPayload {
    params: Value,
    objects: Arc<HashMap<Arc<str>, Arc<dyn RemoteObject>>>,
}

impl EventPayload {
    pub(crate) fn new(params: Value, objects: HashMap<Arc<str>, Arc<dyn RemoteObject>>) -> Self {
        Self {
            params,
            objects: Arc::new(objects),
        }
    }

    /// Payload carrying parameters but no object references.
    pub fn from_params(params: Value) -> Self {
        Self {
            params,
            objects: Arc::new(HashMap::new()),
        }
    }

    /// The raw event parameters.
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// A field of the parameters, if present.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// The proxy referenced by `params[key]`, if it is a reference to a
    /// live object.
    pub fn object(&self, key: &str) -> Option<Arc<dyn RemoteObject>> {
        let guid = self.params.get(key)?.get("guid")?.as_str()?;
        self.object_by_guid(guid)
    }

    /// The proxy with the given guid, if it was referenced by this payload.
    pub fn object_by_guid(&self, guid: &str) -> Option<Arc<dyn RemoteObject>> {
        self.objects.get(guid).cloned()
    }
}

impl fmt::Debug for EventPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPayload")
            .field("params", &self.params)
            .field("objects", &self.objects.keys().collect::<Vec<_>>())
            .finish()
    }
}

struct Entry {
    id: ListenerId,
    handler: Handler,
    once: bool,
}

#[derive(Default)]
struct Listeners {
    next_id: ListenerId,
    table: HashMap<String, Vec<Entry>>,
}

/// Name-keyed listener registry with synchronous fan-out.
#[derive(Default)]
pub struct EventEmitter {
    inner: Mutex<Listeners>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener invoked on every emission of `event`.
    pub fn on<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: Fn(EventPayload) + Send + Sync + 'static,
    {
        self.add(event, Arc::new(handler), false).0
    }

    /// Registers a listener removed after its first invocation.
    pub fn once<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: Fn(EventPayload) + Send + Sync + 'static,
    {
        self.add(event, Arc::new(handler), true).0
    }

    /// Adds a listener and reports how many were registered for the event
    /// before it, taken under the same lock as the insertion.
    pub(crate) fn add(&self, event: &str, handler: Handler, once: bool) -> (ListenerId, usize) {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let entries = inner.table.entry(event.to_string()).or_default();
        let before = entries.len();
        entries.push(Entry { id, handler, once });
        (id, before)
    }

    /// Removes one listener. Returns how many remain for the event, or
    /// `None` if the id was not registered (e.g. a one-shot that already
    /// fired).
    pub fn remove(&self, event: &str, id: ListenerId) -> Option<usize> {
        let mut inner = self.inner.lock();
        let entries = inner.table.get_mut(event)?;
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        if entries.len() == before {
            return None;
        }
        let remaining = entries.len();
        if remaining == 0 {
            inner.table.remove(event);
        }
        Some(remaining)
    }

    /// Number of listeners currently registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .lock()
            .table
            .get(event)
            .map_or(0, |entries| entries.len())
    }

    /// Invokes every listener for `event` synchronously, in registration
    /// order. One-shot listeners are dropped from the table before their
    /// handler runs. Returns whether anyone was listening.
    pub fn emit(&self, event: &str, payload: EventPayload) -> bool {
        let fired: Vec<Handler> = {
            let mut inner = self.inner.lock();
            match inner.table.get_mut(event) {
                Some(entries) => {
                    let fired = entries
                        .iter()
                        .map(|entry| Arc::clone(&entry.handler))
                        .collect();
                    entries.retain(|entry| !entry.once);
                    if entries.is_empty() {
                        inner.table.remove(event);
                    }
                    fired
                }
                None => Vec::new(),
            }
        };
        for handler in &fired {
            handler(payload.clone());
        }
        !fired.is_empty()
    }
}
