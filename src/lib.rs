//! Realtime relay for classroom quiz sessions.
//!
//! Browsers connect over WebSocket, identify as teacher, student or group
//! member of a session, and exchange encrypted JSON envelopes that the server
//! fans out by scope. Everything runs on one `mio` loop.

pub mod config;
pub mod crypto;
pub mod net;
pub mod pidfile;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;

pub use config::Config;
pub use server::{Server, ServerHandle};
