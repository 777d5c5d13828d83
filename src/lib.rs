//! Message correlation and event routing over one shared connection.
//!
//! DESIGN
//! ======
//! Many independent surfaces share one duplex WebSocket to a backend. Two
//! traffic patterns ride on it:
//! - correlated calls: a request frame carries a fresh `requestId`, and the
//!   response echoing it settles exactly that caller
//! - unsolicited frames: routed by `type` to topic subscribers, with
//!   `streamId` runs merged into one result
//!
//! Inbound: transport → [`Channel`] → registry | bus (+ stream aggregator).
//! Outbound: [`Client::request`] / [`Client::send`] → [`Channel`] → transport.
//!
//! A connection generation guards against a reconnect resurrecting requests
//! or streams that belong to a dead socket.

pub mod bus;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod registry;
pub mod stream;
pub mod transport;

pub use bus::{EventBus, Subscription, SubscriptionId, Topic};
pub use channel::{Channel, ChannelStats, Delivery};
pub use client::{Client, RequestOptions};
pub use config::ClientConfig;
pub use error::ClientError;
pub use frames::Frame;
pub use registry::{CorrelationRegistry, PendingCall};
pub use stream::{IncompleteReason, StreamAggregator, StreamEvent, StreamResult, StreamSubscription};
pub use transport::LinkHandle;
