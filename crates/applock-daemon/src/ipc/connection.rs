//! Socket transport shared by the control socket and the privileged feed
//!
//! Both endpoints are local stream sockets carrying JSON lines. The server
//! side binds a filesystem path that only the owning user may open.

use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Listening end of a local socket
#[async_trait]
pub trait SocketListener: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Bind `path`, replacing a socket file left behind by a dead daemon
    ///
    /// Fails if another process is still serving on `path`.
    async fn bind(path: &Path) -> Result<Self>
    where
        Self: Sized;

    /// Wait for the next host or helper to connect
    async fn accept(&self) -> Result<Self::Stream>;

    /// Unlink the socket file
    async fn remove_socket(&self) -> Result<()>;
}

/// Connecting end of a local socket
#[async_trait]
pub trait SocketConnector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Connect to a running daemon
    async fn connect(path: &Path) -> Result<Self::Stream>;
}

#[cfg(unix)]
pub use super::unix::{UnixSocketConnector as PlatformConnector, UnixSocketListener as PlatformListener};
