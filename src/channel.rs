//! Channel: the single owner of the duplex connection.
//!
//! DESIGN
//! ======
//! The channel never touches a socket. A link is an unbounded sender into
//! the writer task of one WebSocket (see `transport`), tagged with the
//! connection generation it was attached under. While no link is attached,
//! outbound frames wait in a bounded queue that drops its oldest entry on
//! overflow.
//!
//! Inbound text goes through [`Channel::on_message_from`] in arrival order:
//! responses settle the registry, everything else fans out on the bus, and
//! frames carrying a `streamId` are also appended to the aggregator. All of
//! it runs synchronously on the caller's task with the channel lock
//! released, so handlers may send from inside a callback.
//!
//! LOCK ORDER
//! ==========
//! channel state → registry. The registry, bus and aggregator never call
//! back into the channel.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use frames::{Frame, Route};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::bus::EventBus;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::registry::{CorrelationRegistry, PendingCall, Registration};
use crate::stream::StreamAggregator;

/// Outcome of feeding one inbound message to the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A response frame. `resolved` is false for late or unknown ids.
    Response { resolved: bool },
    /// An event frame and the number of handlers that ran.
    Event { handlers: usize },
    /// The text did not decode as a frame.
    Malformed,
    /// The message arrived on a connection that is no longer live.
    Stale,
}

/// Point-in-time counters for the connection and its components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub generation: u64,
    pub connected: bool,
    pub queued_frames: usize,
    pub dropped_frames: u64,
    pub protocol_errors: u64,
    pub stale_frames: u64,
    pub pending_requests: usize,
    pub open_streams: usize,
}

/// Per-call options for [`Channel::call`].
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    pub timeout: Duration,
    pub notify_disconnect: bool,
}

struct Link {
    generation: u64,
    tx: mpsc::UnboundedSender<String>,
}

struct Queued {
    request_id: Option<String>,
    text: String,
}

struct ChannelState {
    generation: u64,
    link: Option<Link>,
    queue: VecDeque<Queued>,
    capacity: usize,
    dropped_frames: u64,
    protocol_errors: u64,
    stale_frames: u64,
}

pub struct Channel {
    registry: CorrelationRegistry,
    bus: EventBus,
    streams: StreamAggregator,
    state: Mutex<ChannelState>,
}

impl Channel {
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            registry: CorrelationRegistry::new(),
            bus: EventBus::new(),
            streams: StreamAggregator::new(config.stream_idle_timeout, config.emit_partials),
            state: Mutex::new(ChannelState {
                generation: 0,
                link: None,
                queue: VecDeque::new(),
                capacity: config.queue_capacity.max(1),
                dropped_frames: 0,
                protocol_errors: 0,
                stale_frames: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    #[must_use]
    pub fn streams(&self) -> &StreamAggregator {
        &self.streams
    }

    // =========================================================================
    // CONNECTION LIFECYCLE
    // =========================================================================

    /// Attach a freshly opened connection.
    ///
    /// Advances the generation, flushes queued frames into `tx`, and
    /// invalidates requests and streams left over from older connections.
    /// Returns the new generation.
    pub fn attach(&self, tx: mpsc::UnboundedSender<String>) -> u64 {
        let (generation, flushed, skipped) = {
            let mut state = self.state();
            state.generation += 1;
            let generation = state.generation;

            let mut flushed = 0;
            let mut skipped = 0;
            while let Some(queued) = state.queue.pop_front() {
                let settled = queued
                    .request_id
                    .as_deref()
                    .is_some_and(|id| !self.registry.is_pending(id));
                if settled {
                    skipped += 1;
                    continue;
                }
                if let Err(mpsc::error::SendError(text)) = tx.send(queued.text) {
                    // Writer already gone; keep the rest for the next link.
                    state.queue.push_front(Queued {
                        request_id: queued.request_id,
                        text,
                    });
                    break;
                }
                flushed += 1;
            }

            state.link = Some(Link { generation, tx });
            (generation, flushed, skipped)
        };

        let superseded = self.registry.invalidate_before(generation);
        let discarded = self.streams.advance_generation(generation);
        info!(generation, flushed, skipped, superseded, discarded, "channel: connected");
        generation
    }

    /// The link attached under `generation` has closed.
    ///
    /// Requests that opted into disconnect notification settle with
    /// `Disconnected`; the rest keep waiting on their own timeout. A second
    /// call for the same generation, or one for a superseded link, is a
    /// no-op.
    pub fn close_link(&self, generation: u64) -> bool {
        {
            let mut state = self.state();
            if state.link.as_ref().is_none_or(|link| link.generation != generation) {
                return false;
            }
            state.link = None;
        }
        let notified = self.registry.disconnect(generation);
        info!(generation, notified, "channel: disconnected");
        true
    }

    /// Close whatever link is attached. Returns its generation.
    pub fn detach(&self) -> Option<u64> {
        let generation = self.state().link.as_ref().map(|link| link.generation)?;
        self.close_link(generation).then_some(generation)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().link.is_some()
    }

    /// True while the link attached under `generation` is the live one.
    #[must_use]
    pub fn is_live(&self, generation: u64) -> bool {
        self.state().link.as_ref().is_some_and(|link| link.generation == generation)
    }

    /// Generation of the live link, or of the last one if none is attached.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Write `frame`, or queue it while disconnected.
    ///
    /// Returns the generation the frame will be written under.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Codec`] if the frame cannot be encoded.
    pub fn send(&self, frame: &Frame) -> Result<u64, ClientError> {
        let text = frames::encode_frame(frame)?;
        let outcome = {
            let mut state = self.state();
            state.deliver(Queued {
                request_id: frame.request_id.clone(),
                text,
            })
        };
        Ok(self.settle_outcome(outcome))
    }

    /// Register a request and write its frame in one step, so the request
    /// is tagged with the generation its frame is actually written under.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Codec`] if the frame cannot be encoded; the
    /// registration is withdrawn.
    pub fn call(&self, kind: &str, payload: Value, options: CallOptions) -> Result<PendingCall, ClientError> {
        let (call, outcome) = {
            let mut state = self.state();
            let generation = state.write_generation();
            let call = self.registry.register(Registration {
                timeout: options.timeout,
                generation,
                notify_disconnect: options.notify_disconnect,
            });
            let frame = Frame::request(kind, call.id(), payload);
            let text = frames::encode_frame(&frame)?;
            trace!(request_id = %call.id(), %kind, generation, "channel: request");
            let outcome = state.deliver(Queued {
                request_id: frame.request_id,
                text,
            });
            // Writer gone: the frame went back to the queue and will be
            // written under the next link.
            if outcome.generation != generation {
                self.registry.retag(call.id(), outcome.generation);
            }
            (call, outcome)
        };
        self.settle_outcome(outcome);
        Ok(call)
    }

    fn settle_outcome(&self, outcome: DeliverOutcome) -> u64 {
        if let Some(request_id) = outcome.evicted_request {
            self.registry.reject(
                &request_id,
                ClientError::QueueOverflow {
                    request_id: request_id.clone(),
                },
            );
        }
        if let Some(generation) = outcome.lost_link {
            let notified = self.registry.disconnect(generation);
            info!(generation, notified, "channel: writer gone, link dropped");
        }
        outcome.generation
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Feed one inbound message from the live connection.
    pub fn on_message(&self, raw: &str) -> Delivery {
        self.route(raw)
    }

    /// Feed one inbound message read from the link of `generation`.
    /// Messages from a link that is no longer live are dropped.
    pub fn on_message_from(&self, generation: u64, raw: &str) -> Delivery {
        {
            let mut state = self.state();
            let live = state.link.as_ref().map(|link| link.generation);
            if live != Some(generation) {
                state.stale_frames += 1;
                drop(state);
                debug!(generation, ?live, "channel: dropping frame from stale connection");
                return Delivery::Stale;
            }
        }
        self.route(raw)
    }

    fn route(&self, raw: &str) -> Delivery {
        let frame = match frames::decode_frame(raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.state().protocol_errors += 1;
                let err = ClientError::Protocol(e.to_string());
                warn!(error = %err, bytes = raw.len(), "channel: dropping malformed frame");
                return Delivery::Malformed;
            }
        };

        if let Some(stream_id) = frame.stream_id.as_deref() {
            self.streams
                .append(stream_id, &frame.kind, frame.payload.clone(), frame.is_final);
        }

        match frame.route() {
            Route::Response(id) => {
                let id = id.to_owned();
                Delivery::Response {
                    resolved: self.registry.resolve(&id, frame),
                }
            }
            Route::Event(topic) => Delivery::Event {
                handlers: self.bus.dispatch(topic, &frame),
            },
        }
    }

    /// Discard streams that have gone idle.
    pub fn sweep_streams(&self) -> usize {
        self.streams.sweep_idle(tokio::time::Instant::now())
    }

    #[must_use]
    pub fn stats(&self) -> ChannelStats {
        let (generation, connected, queued_frames, dropped_frames, protocol_errors, stale_frames) = {
            let state = self.state();
            (
                state.generation,
                state.link.is_some(),
                state.queue.len(),
                state.dropped_frames,
                state.protocol_errors,
                state.stale_frames,
            )
        };
        ChannelStats {
            generation,
            connected,
            queued_frames,
            dropped_frames,
            protocol_errors,
            stale_frames,
            pending_requests: self.registry.len(),
            open_streams: self.streams.open_streams(),
        }
    }
}

struct DeliverOutcome {
    generation: u64,
    evicted_request: Option<String>,
    lost_link: Option<u64>,
}

impl ChannelState {
    /// Generation a frame sent now will be written under.
    fn write_generation(&self) -> u64 {
        match &self.link {
            Some(link) => link.generation,
            None => self.generation + 1,
        }
    }

    fn deliver(&mut self, mut queued: Queued) -> DeliverOutcome {
        let mut lost_link = None;
        if let Some(link) = &self.link {
            let generation = link.generation;
            match link.tx.send(queued.text) {
                Ok(()) => {
                    return DeliverOutcome {
                        generation,
                        evicted_request: None,
                        lost_link: None,
                    };
                }
                Err(mpsc::error::SendError(text)) => {
                    self.link = None;
                    lost_link = Some(generation);
                    queued = Queued {
                        request_id: queued.request_id,
                        text,
                    };
                }
            }
        }

        let mut evicted_request = None;
        if self.queue.len() >= self.capacity {
            if let Some(evicted) = self.queue.pop_front() {
                self.dropped_frames += 1;
                warn!(
                    capacity = self.capacity,
                    request_id = evicted.request_id.as_deref().unwrap_or(""),
                    "channel: outbound queue full, dropping oldest frame"
                );
                evicted_request = evicted.request_id;
            }
        }
        self.queue.push_back(queued);
        trace!(queued = self.queue.len(), "channel: frame queued");

        DeliverOutcome {
            generation: self.generation + 1,
            evicted_request,
            lost_link,
        }
    }
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod tests;
