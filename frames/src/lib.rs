//! Shared frame model and JSON codec for the multiplexed client channel.
//!
//! This crate owns the wire representation. Payloads stay flexible
//! (`serde_json::Value`) and `type` is an opaque routing key: nothing here
//! branches on its value.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error returned by [`decode_frame`] and [`encode_frame`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The raw text is not a JSON object with the expected frame shape.
    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
    /// The frame decoded but carries an empty `type`.
    #[error("frame is missing a non-empty `type`")]
    MissingType,
    /// The frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A single message on the shared duplex connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    /// Opaque routing key owned by collaborators, e.g. `"showInputBox"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlation identifier. Set on requests and echoed on responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Joins the partial frames of one logical streamed result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    /// Marks the terminating chunk of a stream.
    #[serde(rename = "final", default, skip_serializing_if = "is_false")]
    pub is_final: bool,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: Value,
    /// Error message carried by a failed response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds since the Unix epoch when the frame was created.
    #[serde(default)]
    pub timestamp: i64,
}

/// How an inbound frame is routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route<'a> {
    /// Settles the outstanding request with this identifier.
    Response(&'a str),
    /// Unsolicited frame, fanned out by topic.
    Event(&'a str),
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(value: &bool) -> bool {
    !*value
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(duration) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(duration.as_millis()).unwrap_or(0)
}

impl Frame {
    /// Create a request frame carrying a correlation identifier.
    pub fn request(kind: impl Into<String>, request_id: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: Some(request_id.into()),
            ..Self::event(kind, payload)
        }
    }

    /// Create an uncorrelated frame (one-way command or pushed event).
    pub fn event(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            request_id: None,
            stream_id: None,
            is_final: false,
            payload,
            error: None,
            timestamp: now_ms(),
        }
    }

    /// Create one chunk of a streamed result.
    pub fn chunk(kind: impl Into<String>, stream_id: impl Into<String>, payload: Value, is_final: bool) -> Self {
        Self {
            stream_id: Some(stream_id.into()),
            is_final,
            ..Self::event(kind, payload)
        }
    }

    /// Build the response to this request. Echoes `type` and `requestId`.
    #[must_use]
    pub fn reply(&self, payload: Value) -> Self {
        Self {
            request_id: self.request_id.clone(),
            ..Self::event(self.kind.clone(), payload)
        }
    }

    /// Build a failed response to this request.
    #[must_use]
    pub fn reply_error(&self, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..self.reply(Value::Null)
        }
    }

    #[must_use]
    pub fn with_stream(mut self, stream_id: impl Into<String>, is_final: bool) -> Self {
        self.stream_id = Some(stream_id.into());
        self.is_final = is_final;
        self
    }

    /// Classify the frame for inbound routing.
    #[must_use]
    pub fn route(&self) -> Route<'_> {
        match self.request_id.as_deref() {
            Some(id) => Route::Response(id),
            None => Route::Event(&self.kind),
        }
    }
}

/// Encode a frame into its JSON wire text.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the payload cannot be serialized.
pub fn encode_frame(frame: &Frame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(CodecError::Encode)
}

/// Decode JSON wire text into a frame.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed text and
/// [`CodecError::MissingType`] when `type` is empty.
pub fn decode_frame(raw: &str) -> Result<Frame, CodecError> {
    let frame: Frame = serde_json::from_str(raw).map_err(CodecError::Decode)?;
    if frame.kind.is_empty() {
        return Err(CodecError::MissingType);
    }
    Ok(frame)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
