//! Type registry: maps protocol type tags to proxy constructors.
//!
//! `__create__` frames carry a type name chosen by the engine. The dispatcher
//! knows nothing about concrete proxy types; it asks the registry to build
//! one. Consumers register a constructor per type they understand:
//!
//! ```ignore
//! let mut registry = TypeRegistry::default();
//! registry.register("Page", |parent, type_name, guid, initializer| {
//!     Ok(Arc::new(Page::new(parent, type_name, guid, initializer)) as Arc<dyn RemoteObject>)
//! });
//! ```
//!
//! A type the registry does not know is a protocol error: the engine and the
//! client disagree about the protocol, and dispatch cannot safely continue.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::binding_call::BindingCall;
use crate::error::{Error, Result};
use crate::object::{ObjectParent, RemoteObject};

/// Builds one concrete proxy from a `__create__` frame.
pub type Constructor =
    Box<dyn Fn(ObjectParent, String, Arc<str>, Value) -> Result<Arc<dyn RemoteObject>> + Send + Sync>;

/// Registration table consulted for every `__create__` frame.
pub struct TypeRegistry {
    constructors: HashMap<String, Constructor>,
}

impl TypeRegistry {
    /// An empty registry. Most callers want [`TypeRegistry::default`], which
    /// already knows the built-in types.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registers the constructor for a protocol type, replacing any previous
    /// registration for the same tag.
    pub fn register<F>(&mut self, type_name: &str, constructor: F)
    where
        F: Fn(ObjectParent, String, Arc<str>, Value) -> Result<Arc<dyn RemoteObject>>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(type_name.to_string(), Box::new(constructor));
    }

    /// Whether a constructor is registered for the given tag.
    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    pub(crate) fn create(
        &self,
        parent: ObjectParent,
        type_name: &str,
        guid: Arc<str>,
        initializer: Value,
    ) -> Result<Arc<dyn RemoteObject>> {
        let constructor = self.constructors.get(type_name).ok_or_else(|| {
            Error::Protocol(format!("unknown object type in __create__: {type_name}"))
        })?;
        constructor(parent, type_name.to_string(), guid, initializer)
    }
}

impl Default for TypeRegistry {
    /// Registry with the built-in types: `BindingCall`.
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register("BindingCall", |parent, type_name, guid, initializer| {
            Ok(Arc::new(BindingCall::new(parent, type_name, guid, initializer))
                as Arc<dyn RemoteObject>)
        });
        registry
    }
}
