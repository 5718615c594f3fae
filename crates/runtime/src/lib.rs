//! tether-runtime - client-side proxy runtime for a remote automation engine.
//!
//! The engine owns all real state; the local process holds lightweight
//! proxies that mirror remote objects by identity and forward method calls
//! as correlated request/response messages over one shared transport. This
//! crate is the plumbing every typed proxy rides on:
//!
//! - **Connection**: request correlation, in-order frame dispatch, and the
//!   guid-keyed registry of live objects
//! - **ProxyObject / RemoteObject**: identity, parent/child lifecycle, and
//!   per-object eventing for remote-backed objects
//! - **Channel**: the per-object call facade (send, send-as-dict, no-reply)
//! - **Waiter**: composable condition/timeout waiting that settles once
//! - **BindingCall**: engine-to-client calls with a mandatory recovery
//!   boundary
//! - **Transport / EngineProcess**: message framing over pipes or WebSocket
//!   and the engine process lifecycle
//!
//! # Architecture
//!
//! ```text
//! typed proxies (pages, contexts, ...)   <- consumers of this crate
//!        │ RemoteObject / Channel
//! ┌──────▼───────┐
//! │  Connection  │  correlation + dispatch + registry
//! ├──────────────┤
//! │  Transport   │  pipe / websocket framing
//! ├──────────────┤
//! │ EngineProcess│  spawned engine, stdio wired up
//! └──────────────┘
//! ```
//!
//! # Dispatch model
//!
//! One task reads frames and dispatches them strictly in arrival order.
//! Callers suspended in [`Channel::send`] are woken by their response frame;
//! events fan out synchronously to listeners and armed [`Waiter`]s. Work
//! that blocks (binding-call execution above all) runs on its own task so
//! it cannot stall dispatch.

pub mod binding_call;
pub mod channel;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod factory;
pub mod object;
pub mod transport;
pub mod waiter;

pub use binding_call::{BindingArguments, BindingCall, BindingFunction, BindingSource};
pub use channel::Channel;
pub use connection::{
    Connection, ConnectionLike, Event, Message, Metadata, RemoteError, Request, Response,
    WireError,
};
pub use engine::EngineProcess;
pub use error::{Error, Result};
pub use events::{EventEmitter, EventPayload, ListenerId};
pub use factory::{Constructor, TypeRegistry};
pub use object::{DisposeReason, ObjectParent, ProxyObject, RemoteObject, Root};
pub use transport::{PipeTransport, Transport, TransportParts, TransportReceiver, WebSocketTransport};
pub use waiter::Waiter;
