//! Composable, cancellable event waiting.
//!
//! A [`Waiter`] arms listeners on any number of proxy objects and settles
//! exactly once: with the first matching event payload, with the error of a
//! designated reject event (e.g. the parent closing), or with a timeout.
//! Settlement removes every listener the waiter registered.
//!
//! ```ignore
//! let payload = Waiter::new()
//!     .with_timeout(Duration::from_secs(5))
//!     .reject_on(&page, "close", Error::ObjectDisposed { .. })
//!     .wait_for_event(&page, "download")
//!     .wait()
//!     .await?;
//! ```

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::events::{EventPayload, ListenerId};
use crate::object::RemoteObject;

type Predicate = Box<dyn Fn(&EventPayload) -> bool + Send + Sync>;

struct Registration {
    object: Arc<dyn RemoteObject>,
    event: String,
    listener: ListenerId,
}

/// Single-assignment outcome slot raced by every source.
struct Shared {
    outcome_tx: Mutex<Option<oneshot::Sender<Result<EventPayload>>>>,
    registrations: Mutex<Vec<Registration>>,
}

impl Shared {
    /// First call wins; the slot is written and every registered listener
    /// removed. Later calls are no-ops.
    fn settle(&self, outcome: Result<EventPayload>) {
        let Some(tx) = self.outcome_tx.lock().take() else {
            return;
        };
        let _ = tx.send(outcome);
        self.release_listeners();
    }

    /// Drops the slot without an outcome. Used when nobody will look at the
    /// result anymore.
    fn abandon(&self) {
        if self.outcome_tx.lock().take().is_none() {
            return;
        }
        self.release_listeners();
    }

    fn release_listeners(&self) {
        for registration in self.registrations.lock().drain(..) {
            registration
                .object
                .core()
                .remove_listener(&registration.event, registration.listener);
        }
    }
}

/// Waits for one of several events, an abort event, or a deadline.
pub struct Waiter {
    shared: Arc<Shared>,
    outcome_rx: Option<oneshot::Receiver<Result<EventPayload>>>,
    timeout: Option<Duration>,
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Waiter {
    pub fn new() -> Self {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        Self {
            shared: Arc::new(Shared {
                outcome_tx: Mutex::new(Some(outcome_tx)),
                registrations: Mutex::new(Vec::new()),
            }),
            outcome_rx: Some(outcome_rx),
            timeout: None,
        }
    }

    /// Caps the wait; expiry settles the waiter with a timeout error.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Arms a success source: any emission of `event` on `object` settles
    /// the waiter with that payload.
    pub fn wait_for_event(self, object: &Arc<dyn RemoteObject>, event: &str) -> Self {
        self.arm(object, event, None)
    }

    /// Arms a success source that only matches payloads accepted by
    /// `predicate`. A predicate that panics counts as no match.
    pub fn wait_for_event_matching<P>(
        self,
        object: &Arc<dyn RemoteObject>,
        event: &str,
        predicate: P,
    ) -> Self
    where
        P: Fn(&EventPayload) -> bool + Send + Sync + 'static,
    {
        self.arm(object, event, Some(Box::new(predicate)))
    }

    /// Arms an abort source: any emission of `event` on `object` settles the
    /// waiter with `error`.
    pub fn reject_on(self, object: &Arc<dyn RemoteObject>, event: &str, error: Error) -> Self {
        let shared = Arc::clone(&self.shared);
        let pending = Mutex::new(Some(error));
        let listener = object.core().on(event, move |_payload| {
            if let Some(error) = pending.lock().take() {
                shared.settle(Err(error));
            }
        });
        self.record(object, event, listener)
    }

    fn arm(self, object: &Arc<dyn RemoteObject>, event: &str, predicate: Option<Predicate>) -> Self {
        let shared = Arc::clone(&self.shared);
        let listener = object.core().on(event, move |payload| {
            let matched = match &predicate {
                Some(predicate) => {
                    catch_unwind(AssertUnwindSafe(|| predicate(&payload))).unwrap_or(false)
                }
                None => true,
            };
            if matched {
                shared.settle(Ok(payload));
            }
        });
        self.record(object, event, listener)
    }

    fn record(self, object: &Arc<dyn RemoteObject>, event: &str, listener: ListenerId) -> Self {
        self.shared.registrations.lock().push(Registration {
            object: Arc::clone(object),
            event: event.to_string(),
            listener,
        });
        self
    }

    /// Suspends until the first settlement and returns it.
    pub async fn wait(mut self) -> Result<EventPayload> {
        let mut rx = self.outcome_rx.take().expect("wait() consumed twice");
        match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut rx).await {
                Ok(outcome) => outcome.unwrap_or_else(|_| Err(abandoned())),
                Err(_elapsed) => {
                    // Whoever takes the slot first decides; re-reading the
                    // receiver picks up a source that beat the deadline.
                    self.shared.settle(Err(Error::Timeout(format!(
                        "no matching event within {timeout:?}"
                    ))));
                    match rx.await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(abandoned()),
                    }
                }
            },
            None => rx.await.unwrap_or_else(|_| Err(abandoned())),
        }
    }

    /// Runs `action` with the waiter already armed, then waits. Use this
    /// when the action triggers the awaited event, so an event that fires
    /// before the wait begins is not lost. An action error wins over any
    /// settlement.
    pub async fn expect<T, F>(self, action: F) -> Result<EventPayload>
    where
        F: Future<Output = Result<T>>,
    {
        match action.await {
            Ok(_) => self.wait().await,
            Err(err) => Err(err),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.shared.abandon();
    }
}

fn abandoned() -> Error {
    Error::Protocol("waiter dropped without settlement".to_string())
}
