//! Local control socket
//!
//! Hosts (the presenter surface, the biometric prompt, the accessibility and
//! usage feeds, the settings UI) talk to the daemon over a Unix domain socket
//! using one JSON message per line.

mod client;
mod connection;
mod server;
mod types;

#[cfg(unix)]
mod unix;

#[cfg(not(unix))]
compile_error!("applockd serves its control socket over Unix domain sockets");

pub use client::{HostSubscription, IpcClient};
pub use connection::{PlatformConnector, PlatformListener, SocketConnector, SocketListener};
pub use server::{IpcContext, IpcServer};
pub use types::{IpcRequest, IpcResponse};
