//! Stream aggregator: rebuilds one logical result from partial frames.
//!
//! DESIGN
//! ======
//! Chunks sharing a `streamId` are buffered in arrival order; the wire
//! carries no sequence number, so arrival order is the only order. A final
//! chunk completes the stream: listeners get one `Complete` event with the
//! whole buffer and the state is discarded. A stream that goes quiet for the
//! idle window, or whose connection is replaced, is discarded with an
//! `Incomplete` event instead of vanishing silently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bus::invoke_isolated;

pub type StreamListener = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// The assembled chunks of one stream.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamResult {
    pub stream_id: String,
    /// `type` of the frame that opened the stream.
    pub kind: String,
    pub chunks: Vec<Value>,
}

impl StreamResult {
    /// Concatenate the string chunks. Non-string chunks are rendered as JSON.
    #[must_use]
    pub fn text(&self) -> String {
        self.chunks
            .iter()
            .map(|chunk| match chunk {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect()
    }
}

/// Why a stream was discarded before its final chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncompleteReason {
    /// No chunk arrived for the idle window.
    Idle,
    /// The connection the stream belonged to was replaced.
    Superseded,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// A non-final chunk arrived. `received` counts chunks so far.
    Partial {
        stream_id: String,
        kind: String,
        chunk: Value,
        received: usize,
    },
    Complete(StreamResult),
    Incomplete {
        result: StreamResult,
        reason: IncompleteReason,
    },
}

struct StreamState {
    kind: String,
    buffer: Vec<Value>,
    generation: u64,
    last_activity: Instant,
}

#[derive(Default)]
struct AggregatorInner {
    streams: HashMap<String, StreamState>,
    listeners: Vec<(u64, StreamListener)>,
    next_listener: u64,
    generation: u64,
}

#[derive(Clone)]
pub struct StreamAggregator {
    inner: Arc<Mutex<AggregatorInner>>,
    idle_timeout: Duration,
    emit_partials: bool,
}

impl StreamAggregator {
    #[must_use]
    pub fn new(idle_timeout: Duration, emit_partials: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AggregatorInner::default())),
            idle_timeout,
            emit_partials,
        }
    }

    fn state(&self) -> MutexGuard<'_, AggregatorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener for every stream event.
    pub fn subscribe(&self, listener: impl Fn(&StreamEvent) + Send + Sync + 'static) -> StreamSubscription {
        let mut state = self.state();
        state.next_listener += 1;
        let id = state.next_listener;
        state.listeners.push((id, Arc::new(listener)));
        StreamSubscription {
            id,
            aggregator: Arc::downgrade(&self.inner),
        }
    }

    /// Append `chunk` to `stream_id`, creating the stream on its first
    /// chunk. Returns the number of chunks buffered so far.
    pub fn append(&self, stream_id: &str, kind: &str, chunk: Value, is_final: bool) -> usize {
        let now = Instant::now();
        let (received, event, listeners) = {
            let mut state = self.state();
            let generation = state.generation;
            let stream = state
                .streams
                .entry(stream_id.to_owned())
                .or_insert_with(|| StreamState {
                    kind: kind.to_owned(),
                    buffer: Vec::new(),
                    generation,
                    last_activity: now,
                });
            stream.last_activity = now;
            let partial = (self.emit_partials && !is_final).then(|| StreamEvent::Partial {
                stream_id: stream_id.to_owned(),
                kind: stream.kind.clone(),
                chunk: chunk.clone(),
                received: stream.buffer.len() + 1,
            });
            stream.buffer.push(chunk);
            let received = stream.buffer.len();

            let event = if is_final {
                state.streams.remove(stream_id).map(|done| {
                    debug!(%stream_id, chunks = received, "stream: complete");
                    StreamEvent::Complete(StreamResult {
                        stream_id: stream_id.to_owned(),
                        kind: done.kind,
                        chunks: done.buffer,
                    })
                })
            } else {
                partial
            };
            let listeners = if event.is_some() {
                state.listener_snapshot()
            } else {
                Vec::new()
            };
            (received, event, listeners)
        };

        if let Some(event) = event {
            notify(&listeners, &event);
        }
        received
    }

    /// Discard streams idle for at least the idle window as of `now`.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let idle_timeout = self.idle_timeout;
        self.evict(
            |stream| now.saturating_duration_since(stream.last_activity) >= idle_timeout,
            IncompleteReason::Idle,
        )
    }

    /// Move to a new connection generation, discarding streams opened under
    /// an older one.
    pub fn advance_generation(&self, generation: u64) -> usize {
        self.state().generation = generation;
        self.evict(|stream| stream.generation < generation, IncompleteReason::Superseded)
    }

    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.state().streams.len()
    }

    #[must_use]
    pub fn is_open(&self, stream_id: &str) -> bool {
        self.state().streams.contains_key(stream_id)
    }

    fn evict(&self, matches: impl Fn(&StreamState) -> bool, reason: IncompleteReason) -> usize {
        let (evicted, listeners) = {
            let mut state = self.state();
            let ids: Vec<String> = state
                .streams
                .iter()
                .filter(|(_, stream)| matches(stream))
                .map(|(id, _)| id.clone())
                .collect();
            let evicted: Vec<StreamResult> = ids
                .into_iter()
                .filter_map(|id| {
                    state.streams.remove(&id).map(|stream| StreamResult {
                        stream_id: id,
                        kind: stream.kind,
                        chunks: stream.buffer,
                    })
                })
                .collect();
            (evicted, state.listener_snapshot())
        };

        let count = evicted.len();
        for result in evicted {
            warn!(
                stream_id = %result.stream_id,
                chunks = result.chunks.len(),
                ?reason,
                "stream: discarded before final chunk"
            );
            notify(&listeners, &StreamEvent::Incomplete { result, reason });
        }
        count
    }
}

impl AggregatorInner {
    fn listener_snapshot(&self) -> Vec<StreamListener> {
        self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

fn notify(listeners: &[StreamListener], event: &StreamEvent) {
    for listener in listeners {
        if let Err(panic) = invoke_isolated(|| listener(event)) {
            warn!(%panic, "stream: listener panicked");
        }
    }
}

/// Handle returned by [`StreamAggregator::subscribe`]. Dropping it
/// removes the listener.
#[must_use = "dropping a StreamSubscription removes its listener"]
pub struct StreamSubscription {
    id: u64,
    aggregator: std::sync::Weak<Mutex<AggregatorInner>>,
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.aggregator.upgrade() {
            let mut state = inner.lock().unwrap_or_else(PoisonError::into_inner);
            state.listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
#[path = "stream_test.rs"]
mod tests;
