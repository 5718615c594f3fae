//! Reverse-direction calls: the engine invoking a function registered
//! locally.
//!
//! Each invocation arrives as its own short-lived proxy object whose
//! initializer names the target function and carries the arguments. `call`
//! executes the local function and always reports back: a returned value as
//! a `resolve` notification, any failure (including a panic) as a structured
//! `reject`. The dispatch loop can never be taken down by user code.

use std::backtrace::Backtrace;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::{Value, json};

use crate::connection::{RemoteError, WireError};
use crate::error::{Error, Result};
use crate::object::{ObjectParent, ProxyObject, RemoteObject};

/// Where a binding invocation originated, derived by walking the proxy tree
/// upward from the originating object.
pub struct BindingSource {
    pub context: Option<Arc<dyn RemoteObject>>,
    pub page: Option<Arc<dyn RemoteObject>>,
    pub frame: Arc<dyn RemoteObject>,
}

/// Arguments of one invocation: a decoded list, or one opaque handle the
/// engine kept by reference.
pub enum BindingArguments {
    Values(Vec<Value>),
    Handle(Arc<dyn RemoteObject>),
}

/// Signature of a locally-registered function.
pub type BindingFunction =
    Arc<dyn Fn(&BindingSource, BindingArguments) -> Result<Value> + Send + Sync>;

/// One invocation of a locally-registered function.
pub struct BindingCall {
    core: ProxyObject,
}

impl RemoteObject for BindingCall {
    fn core(&self) -> &ProxyObject {
        &self.core
    }
}

impl BindingCall {
    pub fn new(
        parent: ObjectParent,
        type_name: String,
        guid: Arc<str>,
        initializer: Value,
    ) -> Self {
        Self {
            core: ProxyObject::new(parent, type_name, guid, initializer),
        }
    }

    /// The name of the function the engine is asking for.
    pub fn name(&self) -> &str {
        self.core
            .initializer()
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Executes `f` and reports its outcome to the engine. Never fails the
    /// caller: a failed or panicking `f`, an unresolvable source, or bad
    /// arguments all turn into a `reject` notification. Run this on its own
    /// task, off the dispatch path.
    pub async fn call(&self, f: BindingFunction) {
        match self.invoke(f) {
            Ok(result) => {
                if let Err(err) = self.core.channel().send("resolve", json!({"result": result})).await
                {
                    tracing::error!(guid = self.core.guid(), %err, "could not resolve binding call");
                }
            }
            Err(err) => {
                let details = serialize_error(&err);
                if let Err(err) = self.core.channel().send("reject", details).await {
                    tracing::error!(guid = self.core.guid(), %err, "could not reject binding call");
                }
            }
        }
    }

    fn invoke(&self, f: BindingFunction) -> Result<Value> {
        let source = self.resolve_source()?;
        let arguments = self.arguments()?;
        match catch_unwind(AssertUnwindSafe(|| f(&source, arguments))) {
            Ok(outcome) => outcome,
            Err(panic) => Err(Error::BindingFailed(panic_message(panic))),
        }
    }

    /// Resolves the originating object and its ancestry. Fails if the
    /// originating object was disposed since the invocation was issued.
    fn resolve_source(&self) -> Result<BindingSource> {
        let guid = self
            .core
            .initializer()
            .get("frame")
            .and_then(|frame| frame.get("guid"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Protocol("binding call initializer missing frame reference".to_string())
            })?;
        let frame = self
            .core
            .connection()
            .get_object(guid)
            .ok_or_else(|| Error::ObjectNotFound(guid.to_string()))?;

        let page = frame.core().parent();
        let context = page.as_ref().and_then(|page| page.core().parent());
        Ok(BindingSource {
            context,
            page,
            frame,
        })
    }

    fn arguments(&self) -> Result<BindingArguments> {
        let initializer = self.core.initializer();
        if let Some(handle) = initializer.get("handle") {
            let guid = handle
                .get("guid")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Protocol("binding handle without guid".to_string()))?;
            let object = self
                .core
                .connection()
                .get_object(guid)
                .ok_or_else(|| Error::ObjectNotFound(guid.to_string()))?;
            return Ok(BindingArguments::Handle(object));
        }

        let values = initializer
            .get("args")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(BindingArguments::Values(values))
    }
}

fn serialize_error(err: &Error) -> Value {
    let wire = WireError {
        error: RemoteError {
            message: err.to_string(),
            name: Some(err.error_name().unwrap_or("Error").to_string()),
            stack: Some(captured_stack()),
        },
    };
    json!({"error": wire})
}

/// Current backtrace with runtime plumbing filtered out.
fn captured_stack() -> String {
    let raw = Backtrace::force_capture().to_string();
    raw.lines()
        .filter(|line| !is_runtime_frame(line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_runtime_frame(line: &str) -> bool {
    ["std::", "core::", "tokio::", "__rust_", "backtrace::"]
        .iter()
        .any(|prefix| line.contains(prefix))
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "binding function panicked".to_string()
    }
}
