//! Client side of rival.
//!
//! A [`Connection`] keeps one WebSocket link to the router, verifies itself
//! under a logical identifier and then offers four call shapes:
//!
//! - correlated calls ([`Connection::request`], [`Connection::ping`],
//!   [`Connection::get_clients`], [`Connection::function_call`]);
//! - uncorrelated broadcasts ([`Connection::inform`]);
//! - inbound requests, answered by locally registered routes;
//! - remote objects: a route may answer with a [`RemoteObject`] whose methods
//!   stay callable from the requesting process until the registration expires.
//!
//! Protocol occurrences are reported through [`EventHandler`] and
//! [`Connection::wait_for`].

mod config;
mod connection;
mod error;
mod events;
mod objects;
mod pending;
mod response;
mod routes;

pub use config::{ConnectionBuilder, ConnectionConfig};
pub use connection::{Connection, Destinations};
pub use error::{Result, RivalError};
pub use events::{Event, EventHandler, EventKind};
pub use objects::{DEFAULT_OBJECT_EXPIRY, MethodCall, RemoteObject};
pub use response::{ObjectProxy, Response};
pub use routes::{Reply, RouteRequest};

pub use rival_core::{ConnectionState, MessagePayload, PayloadType};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Critical sections in this crate never leave the protected maps half
/// updated, so the data is still consistent after a poisoning panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
