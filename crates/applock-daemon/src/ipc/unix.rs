//! Unix domain socket transport

use async_trait::async_trait;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::error::{DaemonError, Result};

use super::connection::{SocketConnector, SocketListener};

/// Owner read/write only
const SOCKET_MODE: u32 = 0o600;

pub struct UnixSocketListener {
    listener: UnixListener,
    path: PathBuf,
}

#[async_trait]
impl SocketListener for UnixSocketListener {
    type Stream = UnixStream;

    async fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            if UnixStream::connect(path).await.is_ok() {
                return Err(DaemonError::Ipc(format!(
                    "{} is already being served",
                    path.display()
                )));
            }
            warn!("Removing stale socket {:?}", path);
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)
            .map_err(|e| DaemonError::Ipc(format!("Failed to bind {}: {}", path.display(), e)))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
        debug!("Bound {:?} with mode {:o}", path, SOCKET_MODE);

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    async fn accept(&self) -> Result<Self::Stream> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| DaemonError::Ipc(format!("Accept on {} failed: {}", self.path.display(), e)))?;
        Ok(stream)
    }

    async fn remove_socket(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

pub struct UnixSocketConnector;

#[async_trait]
impl SocketConnector for UnixSocketConnector {
    type Stream = UnixStream;

    async fn connect(path: &Path) -> Result<Self::Stream> {
        UnixStream::connect(path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused => {
                DaemonError::Ipc(format!("applockd is not listening on {}", path.display()))
            }
            _ => DaemonError::Ipc(format!("Failed to connect to {}: {}", path.display(), e)),
        })
    }
}
