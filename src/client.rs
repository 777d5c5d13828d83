//! Client facade: the one handle collaborators hold.
//!
//! `Client` is a cheap clone over one shared [`Channel`]. Surfaces receive
//! a clone instead of reaching for a global, issue correlated calls with
//! [`Client::request`], push one-way commands with [`Client::send`], and
//! listen with [`Client::on`].

use std::sync::Arc;
use std::time::Duration;

use frames::Frame;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;

use crate::bus::{Subscription, SubscriptionId, Topic};
use crate::channel::{CallOptions, Channel, ChannelStats};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::registry::PendingCall;
use crate::stream::{StreamEvent, StreamSubscription};
use crate::transport::{self, LinkHandle};

/// Per-call overrides for [`Client::request`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Overrides the configured default window.
    pub timeout: Option<Duration>,
    /// Settle with [`ClientError::Disconnected`] if the connection the
    /// request was written on closes first.
    pub notify_disconnect: bool,
}

impl RequestOptions {
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn notify_disconnect(mut self) -> Self {
        self.notify_disconnect = true;
        self
    }
}

#[derive(Clone)]
pub struct Client {
    channel: Arc<Channel>,
    config: ClientConfig,
}

impl Client {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            channel: Arc::new(Channel::new(&config)),
            config,
        }
    }

    #[must_use]
    pub fn from_env() -> Self {
        Self::new(ClientConfig::from_env())
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    // =========================================================================
    // CONNECTION
    // =========================================================================

    /// Dial `url` once and attach it as the live connection.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] if the handshake fails.
    pub async fn connect(&self, url: &str) -> Result<LinkHandle, ClientError> {
        transport::connect(Arc::clone(&self.channel), url, self.config.stream_sweep_interval).await
    }

    /// Attach an already established WebSocket.
    pub fn attach<S>(&self, ws: WebSocketStream<S>) -> LinkHandle
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        transport::spawn_link(Arc::clone(&self.channel), ws, self.config.stream_sweep_interval)
    }

    /// Keep a connection to `url` alive in the background.
    pub fn spawn_reconnect(&self, url: impl Into<String>) -> JoinHandle<()> {
        transport::spawn_reconnect(Arc::clone(&self.channel), url.into(), self.config)
    }

    /// Close the live connection. Returns its generation, if there was one.
    pub fn disconnect(&self) -> Option<u64> {
        self.channel.detach()
    }

    // =========================================================================
    // REQUESTS
    // =========================================================================

    /// Write a correlated request and hand back its pending call.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Payload`] if `payload` does not serialize.
    pub fn begin_request(
        &self,
        kind: &str,
        payload: impl Serialize,
        options: RequestOptions,
    ) -> Result<PendingCall, ClientError> {
        let payload = serde_json::to_value(payload)?;
        self.channel.call(
            kind,
            payload,
            CallOptions {
                timeout: options.timeout.unwrap_or(self.config.request_timeout),
                notify_disconnect: options.notify_disconnect,
            },
        )
    }

    /// Issue a correlated request and wait for the response payload.
    ///
    /// # Errors
    ///
    /// Returns the error the call settled with: timeout, cancellation,
    /// overflow, disconnect, supersede, or a remote error.
    pub async fn request(&self, kind: &str, payload: impl Serialize, options: RequestOptions) -> Result<Value, ClientError> {
        let call = self.begin_request(kind, payload, options)?;
        Ok(call.wait().await?.payload)
    }

    /// Like [`Client::request`], decoding the response payload as `T`.
    ///
    /// # Errors
    ///
    /// As [`Client::request`], plus [`ClientError::Payload`] if the response
    /// does not decode as `T`.
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        kind: &str,
        payload: impl Serialize,
        options: RequestOptions,
    ) -> Result<T, ClientError> {
        let value = self.request(kind, payload, options).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Like [`Client::request`], but a timeout or cancellation yields
    /// `Ok(None)`: the "no answer" outcome of an input dialog.
    ///
    /// # Errors
    ///
    /// Returns every other failure unchanged.
    pub async fn request_or_none(
        &self,
        kind: &str,
        payload: impl Serialize,
        options: RequestOptions,
    ) -> Result<Option<Value>, ClientError> {
        match self.request(kind, payload, options).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_no_answer() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Cancel an outstanding request by id. The remote side is not told.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.channel.registry().cancel(request_id)
    }

    /// Fire-and-forget frame with no correlation id.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Payload`] or [`ClientError::Codec`] if the
    /// frame cannot be built.
    pub fn send(&self, kind: &str, payload: impl Serialize) -> Result<(), ClientError> {
        let frame = Frame::event(kind, serde_json::to_value(payload)?);
        self.channel.send(&frame)?;
        Ok(())
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    pub fn on(&self, topic: impl Into<String>, handler: impl Fn(&Frame) + Send + Sync + 'static) -> Subscription {
        self.channel.bus().on(topic, handler)
    }

    pub fn on_topic<T>(&self, handler: impl Fn(T::Payload) + Send + Sync + 'static) -> Subscription
    where
        T: Topic + 'static,
    {
        self.channel.bus().on_topic::<T>(handler)
    }

    pub fn off(&self, topic: &str, id: Option<SubscriptionId>) -> usize {
        self.channel.bus().off(topic, id)
    }

    /// Listen for partial, complete, and incomplete stream results.
    pub fn on_stream(&self, listener: impl Fn(&StreamEvent) + Send + Sync + 'static) -> StreamSubscription {
        self.channel.streams().subscribe(listener)
    }

    #[must_use]
    pub fn stats(&self) -> ChannelStats {
        self.channel.stats()
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
