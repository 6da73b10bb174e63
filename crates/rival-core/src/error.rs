use crate::PayloadType;

/// Error decoding or encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid frame encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed {kind} frame: {reason}")]
    Malformed { kind: PayloadType, reason: String },
}
