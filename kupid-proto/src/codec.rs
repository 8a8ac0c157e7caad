//! JSON encoding and decoding for socket frames.
//!
//! Frames travel as WebSocket text messages, one JSON object per frame.

use crate::event::{InboundEvent, OutboundEvent};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes an [`OutboundEvent`] into a text frame.
///
/// # Errors
///
/// Returns `CodecError::Json` if the event cannot be serialized.
pub fn encode(event: &OutboundEvent) -> Result<String, CodecError> {
    Ok(serde_json::to_string(event)?)
}

/// Decodes an [`InboundEvent`] from a text frame.
///
/// Unknown `type` values decode to [`InboundEvent::Unknown`]; structurally
/// invalid frames are an error.
///
/// # Errors
///
/// Returns `CodecError::Json` if the frame is not a valid event object.
pub fn decode(frame: &str) -> Result<InboundEvent, CodecError> {
    Ok(serde_json::from_str(frame)?)
}

/// Encodes an [`InboundEvent`] into a text frame.
///
/// Used by in-process brokers and test doubles that speak the server side.
///
/// # Errors
///
/// Returns `CodecError::Json` if the event cannot be serialized.
pub fn encode_inbound(event: &InboundEvent) -> Result<String, CodecError> {
    Ok(serde_json::to_string(event)?)
}

/// Decodes an [`OutboundEvent`] written by a client.
///
/// # Errors
///
/// Returns `CodecError::Json` if the frame is not a valid client event.
pub fn decode_outbound(frame: &str) -> Result<OutboundEvent, CodecError> {
    Ok(serde_json::from_str(frame)?)
}
