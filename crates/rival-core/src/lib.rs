//! Core types for rival.
//!
//! This crate provides the wire protocol shared by the client connection and
//! the router: the frame model, the pseudo-object shapes that travel inside
//! frames, and the protocol constants both sides agree on.

mod error;
mod message;
mod object;

pub use error::ProtocolError;
pub use message::{MessagePayload, PayloadType, Route};
pub use object::{FunctionCallData, ObjectDescriptor};

/// Default router host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default router port.
pub const DEFAULT_PORT: u16 = 13254;

/// Default inbound message ceiling, in MiB.
pub const DEFAULT_MAX_DATA_SIZE_MIB: f64 = 2.0;

/// Identifier the router stamps on frames it originates.
pub const ROUTER_ID: &str = "__router__";

/// Error data sent to a socket presenting an identifier that is already active.
pub const ALREADY_AUTHORIZED: &str = "Already authorized.";

/// Error data for an addressed frame with no destination.
pub const DESTINATION_NOT_FOUND: &str = "Destination not found.";

/// Error data for an addressed frame whose destination is not active.
pub const DESTINATION_NOT_CONNECTED: &str = "Destination not connected.";

/// Error data for frames sent before verification completed.
pub const NOT_VERIFIED: &str = "Not verified.";

/// Error data for a request naming a route the receiver does not have.
pub const ROUTE_NOT_FOUND: &str = "Route not found";

/// Error data for a function call against a missing or expired object.
pub const OBJECT_EXPIRED: &str =
    "The called function has either expired or has never been registered";

/// Convert a size in MiB to bytes, saturating at `usize::MAX`.
pub fn mib_to_bytes(mib: f64) -> usize {
    let bytes = (mib * 1_048_576.0).floor();
    if bytes <= 0.0 {
        0
    } else if bytes >= usize::MAX as f64 {
        usize::MAX
    } else {
        bytes as usize
    }
}

/// Client link lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket.
    #[default]
    Disconnected,
    /// Socket established, not yet verified.
    Connecting,
    /// Verification frame sent, waiting for the router.
    Verifying,
    /// Verified; calls are permitted unless on hold.
    Authorized,
}
