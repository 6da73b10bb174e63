use std::time::Duration;

/// Errors surfaced by a [`Connection`](crate::Connection).
#[derive(Debug, thiserror::Error)]
pub enum RivalError {
    /// No open socket, or the link is on hold.
    #[error("the client is currently not ready to send or accept requests")]
    NotReady,

    /// The router has not verified this client yet.
    #[error("client is not authorized")]
    Unauthorized,

    #[error("websocket is already connected")]
    AlreadyConnected,

    /// Invalid or duplicate route registration.
    #[error("invalid route: {0}")]
    RouteType(String),

    #[error("route {0} does not exist")]
    RouteNotFound(String),

    /// A reply that needed a correlation id arrived without one.
    #[error("{0} frame is missing its uuid")]
    MissingCorrelation(rival_core::PayloadType),

    /// A reply whose correlation id matches no pending operation.
    #[error("no pending operation for uuid {0}")]
    UnknownCorrelation(String),

    /// The peer reported a failure while fulfilling the call.
    #[error("remote execution failed: {message}")]
    RemoteExecution {
        message: String,
        traceback: Option<String>,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown event name: {0}")]
    UnknownEvent(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A reply whose `data` does not have the expected shape.
    #[error("invalid reply: {0}")]
    InvalidReply(String),

    #[error("connection closed")]
    Disconnected,

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] rival_core::ProtocolError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RivalError>;
