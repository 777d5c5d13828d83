//! Error type shared by every component of the client.

/// Error returned to callers of the client facade.
///
/// `Timeout`, `Cancelled`, `Disconnected`, `Superseded`, `QueueOverflow`
/// and `Remote` settle exactly one request. `Protocol` and
/// `DuplicateResponse` are only ever logged at the channel boundary.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No response arrived within the request's window.
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    Timeout { request_id: String, timeout_ms: u64 },
    /// The request was cancelled locally before a response arrived.
    #[error("request {request_id} was cancelled")]
    Cancelled { request_id: String },
    /// An inbound frame was malformed or its payload had the wrong shape.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A response arrived for an identifier with no pending entry.
    #[error("no pending request for response {request_id}")]
    DuplicateResponse { request_id: String },
    /// The connection closed and the caller asked to hear about it.
    #[error("connection closed before request {request_id} settled")]
    Disconnected { request_id: String },
    /// The request belongs to a connection that has since been replaced.
    #[error("request {request_id} belongs to superseded connection generation {generation}")]
    Superseded { request_id: String, generation: u64 },
    /// The request frame was evicted from the full outbound queue.
    #[error("request {request_id} was dropped from the full outbound queue")]
    QueueOverflow { request_id: String },
    /// The remote side answered with an error.
    #[error("remote returned error for {kind}: {message}")]
    Remote { kind: String, message: String },
    /// The WebSocket connection or handshake failed.
    #[error("websocket connect failed: {0}")]
    Connect(Box<tokio_tungstenite::tungstenite::Error>),
    /// A frame could not be encoded.
    #[error("frame codec failed: {0}")]
    Codec(#[from] frames::CodecError),
    /// A payload could not be converted to or from JSON.
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ClientError {
    /// True for the two outcomes a dialog treats as "no answer".
    #[must_use]
    pub fn is_no_answer(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Cancelled { .. })
    }
}
