//! Event bus: topic-keyed fan-out of unsolicited frames.
//!
//! DESIGN
//! ======
//! Handlers are stored per topic in registration order. Dispatch snapshots
//! the handler list and releases the lock before invoking anything, so a
//! handler may subscribe or unsubscribe (itself included) while running.
//! Each subscription carries an `active` flag that `off` clears before
//! removing it; dispatch checks the flag right before every invocation.
//!
//! ERROR HANDLING
//! ==============
//! Every invocation runs inside `catch_unwind`. A panicking handler is
//! logged and skipped; its siblings still run.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use frames::Frame;
use serde::de::DeserializeOwned;
use tracing::{trace, warn};

use crate::error::ClientError;

pub type Handler = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Binds a topic name to the payload shape its frames carry.
///
/// ```ignore
/// struct TerminalData;
/// impl Topic for TerminalData {
///     const NAME: &'static str = "terminal-data";
///     type Payload = TerminalChunk;
/// }
/// ```
pub trait Topic {
    const NAME: &'static str;
    type Payload: DeserializeOwned;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Entry {
    id: SubscriptionId,
    handler: Handler,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct BusInner {
    topics: HashMap<String, Vec<Entry>>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` for `topic`. Handlers of one topic run in
    /// registration order.
    pub fn on(&self, topic: impl Into<String>, handler: impl Fn(&Frame) + Send + Sync + 'static) -> Subscription {
        let topic = topic.into();
        let id = {
            let mut state = self.state();
            state.next_id += 1;
            let id = SubscriptionId(state.next_id);
            state.topics.entry(topic.clone()).or_default().push(Entry {
                id,
                handler: Arc::new(handler),
                active: Arc::new(AtomicBool::new(true)),
            });
            id
        };
        trace!(%topic, subscription = id.0, "bus: subscribed");
        Subscription {
            topic,
            id,
            bus: Arc::downgrade(&self.inner),
            attached: true,
        }
    }

    /// Register a handler that receives the decoded payload of `T`.
    ///
    /// A payload that does not decode as `T::Payload` is logged as a
    /// protocol error and skipped for this handler only.
    pub fn on_topic<T>(&self, handler: impl Fn(T::Payload) + Send + Sync + 'static) -> Subscription
    where
        T: Topic + 'static,
    {
        self.on(T::NAME, move |frame: &Frame| {
            match serde_json::from_value::<T::Payload>(frame.payload.clone()) {
                Ok(payload) => handler(payload),
                Err(e) => {
                    let err = ClientError::Protocol(format!("`{}` payload: {e}", T::NAME));
                    warn!(topic = T::NAME, error = %err, "bus: payload does not match topic");
                }
            }
        })
    }

    /// Remove one subscription, or every subscription of `topic` when `id`
    /// is `None`. Returns how many were removed; repeating a call is a no-op.
    pub fn off(&self, topic: &str, id: Option<SubscriptionId>) -> usize {
        let mut state = self.state();
        let Some(entries) = state.topics.get_mut(topic) else {
            return 0;
        };

        let before = entries.len();
        entries.retain(|entry| {
            let remove = id.is_none_or(|id| entry.id == id);
            if remove {
                entry.active.store(false, Ordering::SeqCst);
            }
            !remove
        });
        let removed = before - entries.len();
        if entries.is_empty() {
            state.topics.remove(topic);
        }
        if removed > 0 {
            trace!(%topic, removed, "bus: unsubscribed");
        }
        removed
    }

    /// Invoke the current handlers of `topic`. Returns how many ran to
    /// completion. A topic with no handlers is a silent no-op.
    pub fn dispatch(&self, topic: &str, frame: &Frame) -> usize {
        let snapshot: Vec<(SubscriptionId, Handler, Arc<AtomicBool>)> = {
            let state = self.state();
            let Some(entries) = state.topics.get(topic) else {
                trace!(%topic, "bus: no subscribers");
                return 0;
            };
            entries
                .iter()
                .map(|entry| (entry.id, Arc::clone(&entry.handler), Arc::clone(&entry.active)))
                .collect()
        };

        let mut delivered = 0;
        for (id, handler, active) in snapshot {
            if !active.load(Ordering::SeqCst) {
                continue;
            }
            match invoke_isolated(|| handler(frame)) {
                Ok(()) => delivered += 1,
                Err(panic) => warn!(%topic, subscription = id.0, %panic, "bus: handler panicked"),
            }
        }
        delivered
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state().topics.get(topic).map_or(0, Vec::len)
    }
}

/// Run `f`, containing any panic. The error carries the panic message.
pub(crate) fn invoke_isolated(f: impl FnOnce()) -> Result<(), String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|panic| panic_message(panic.as_ref()))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

/// Handle returned by [`EventBus::on`]. Dropping it unsubscribes.
///
/// Call [`Subscription::detach`] to keep the handler registered until an
/// explicit [`EventBus::off`].
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    topic: String,
    id: SubscriptionId,
    bus: Weak<Mutex<BusInner>>,
    attached: bool,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Keep the handler registered and return its id.
    pub fn detach(mut self) -> SubscriptionId {
        self.attached = false;
        self.id
    }

    /// Unsubscribe now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.attached {
            return;
        }
        if let Some(inner) = self.bus.upgrade() {
            EventBus { inner }.off(&self.topic, Some(self.id));
        }
    }
}

#[cfg(test)]
#[path = "bus_test.rs"]
mod tests;
