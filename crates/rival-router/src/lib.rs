//! The rival router.
//!
//! Peers connect over WebSocket and verify under a logical identifier. The
//! router forwards addressed frames between identifiers, fans out
//! information broadcasts and answers `ping` and `client_list` itself. It
//! never looks inside `data`.
//!
//! A second socket presenting an identifier that is already active is put on
//! hold and answered with `Already authorized.`. When the active socket goes
//! away the held one takes over and receives an unsolicited `success`.

mod config;
mod error;
mod registry;
mod server;

pub use config::RouterConfig;
pub use error::RouterError;
pub use server::{Router, run};
