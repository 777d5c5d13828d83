//! WebSocket transport: binds one socket to the channel as a link.
//!
//! DESIGN
//! ======
//! Each link runs two tasks. The writer drains the link's outbound queue
//! into the sink and closes the socket once the channel lets go of the
//! sender. The reader feeds inbound text to the channel, tagged with the
//! link's generation, and ticks the stream idle sweep. When the reader ends
//! it reports the close to the channel.
//!
//! LIFECYCLE
//! =========
//! 1. Socket open → `Channel::attach` → generation g, queued frames flush
//! 2. Reader: text → `Channel::on_message_from(g, ..)`; tick → sweep
//! 3. Close, error, or local detach → `Channel::close_link(g)`; open
//!    streams keep being swept until they finish or a new link attaches
//! 4. Reconnect loop (optional) sleeps with backoff and starts over

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::error::ClientError;

/// A running link. Await [`LinkHandle::closed`] to learn when it ends.
pub struct LinkHandle {
    generation: u64,
    reader: JoinHandle<()>,
}

impl LinkHandle {
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Resolve once the link has closed and the channel has been told.
    pub async fn closed(self) {
        if let Err(e) = self.reader.await {
            warn!(generation = self.generation, error = %e, "transport: reader task failed");
        }
    }
}

/// Dial `url` and attach the socket as the channel's live link.
///
/// # Errors
///
/// Returns [`ClientError::Connect`] if the handshake fails.
pub async fn connect(channel: Arc<Channel>, url: &str, sweep_interval: Duration) -> Result<LinkHandle, ClientError> {
    let (ws, _response) = connect_async(url)
        .await
        .map_err(|e| ClientError::Connect(Box::new(e)))?;
    info!(%url, "transport: connected");
    Ok(spawn_link(channel, ws, sweep_interval))
}

/// Attach an established WebSocket as the channel's live link.
pub fn spawn_link<S>(channel: Arc<Channel>, ws: WebSocketStream<S>, sweep_interval: Duration) -> LinkHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let generation = channel.attach(tx);

    tokio::spawn(write_loop(sink, rx, generation));
    let reader = tokio::spawn(read_loop(channel, stream, generation, sweep_interval));
    LinkHandle { generation, reader }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::UnboundedReceiver<String>,
    generation: u64,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(text) = rx.recv().await {
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            warn!(generation, error = %e, "transport: write failed");
            return;
        }
    }
    // Channel dropped the sender: local detach or a newer link took over.
    if let Err(e) = sink.close().await {
        debug!(generation, error = %e, "transport: close handshake failed");
    }
}

async fn read_loop<S>(
    channel: Arc<Channel>,
    mut stream: SplitStream<WebSocketStream<S>>,
    generation: u64,
    sweep_interval: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(generation, error = %e, "transport: read failed");
                        break;
                    }
                };
                match msg {
                    Message::Text(text) => {
                        channel.on_message_from(generation, text.as_str());
                    }
                    Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                        Ok(text) => {
                            channel.on_message_from(generation, text);
                        }
                        Err(e) => warn!(generation, error = %e, "transport: dropping non-UTF-8 binary message"),
                    },
                    Message::Close(reason) => {
                        debug!(generation, ?reason, "transport: close received");
                        break;
                    }
                    _ => {}
                }
            }
            _ = sweep.tick() => {
                if !channel.is_live(generation) {
                    break;
                }
                channel.sweep_streams();
            }
        }
    }

    channel.close_link(generation);
    if channel.streams().open_streams() > 0 {
        tokio::spawn(sweep_while_detached(channel, sweep_interval));
    }
}

/// Keep evicting idle streams after the link is gone. Ends once a new link
/// takes over the sweep or no stream is left open.
async fn sweep_while_detached(channel: Arc<Channel>, sweep_interval: Duration) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        sweep.tick().await;
        if channel.is_connected() {
            return;
        }
        channel.sweep_streams();
        if channel.streams().open_streams() == 0 {
            debug!("transport: no open streams left to sweep");
            return;
        }
    }
}

/// Keep the channel connected to `url`, reconnecting with exponential
/// backoff. Abort the returned handle to stop.
pub fn spawn_reconnect(channel: Arc<Channel>, url: String, config: ClientConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = config.reconnect_initial_backoff;
        loop {
            match connect(Arc::clone(&channel), &url, config.stream_sweep_interval).await {
                Ok(link) => {
                    backoff = config.reconnect_initial_backoff;
                    let generation = link.generation();
                    link.closed().await;
                    info!(generation, "transport: link closed");
                }
                Err(e) => warn!(%url, error = %e, "transport: connect failed"),
            }

            debug!(backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX), "transport: reconnecting");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(config.reconnect_max_backoff);
        }
    })
}

#[cfg(test)]
#[path = "transport_test.rs"]
mod tests;
