//! IPC client implementation

use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, ReadHalf};

use crate::error::{DaemonError, Result};
use crate::presenter::HostCommand;

use super::connection::{PlatformConnector, SocketConnector};
use super::types::{IpcRequest, IpcResponse};

type ClientStream = <PlatformConnector as SocketConnector>::Stream;

/// IPC client for hosts and tooling
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    /// Create a new IPC client
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Send a request and get a response
    pub async fn request(&self, request: &IpcRequest) -> Result<IpcResponse> {
        let stream = PlatformConnector::connect(&self.socket_path).await?;

        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);

        // Send request
        let json = serde_json::to_string(request)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        // Read response
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let response: IpcResponse = serde_json::from_str(&line)?;
        Ok(response)
    }

    /// Check if daemon is running
    pub async fn ping(&self) -> bool {
        matches!(
            self.request(&IpcRequest::Ping).await,
            Ok(IpcResponse::Pong { .. })
        )
    }

    /// Open a connection that receives host commands
    pub async fn subscribe(&self) -> Result<HostSubscription> {
        let stream = PlatformConnector::connect(&self.socket_path).await?;
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();

        let json = serde_json::to_string(&IpcRequest::Subscribe)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        let line = lines
            .next_line()
            .await?
            .ok_or_else(|| DaemonError::Ipc("Connection closed".to_string()))?;
        match serde_json::from_str(&line)? {
            IpcResponse::Subscribed => Ok(HostSubscription { lines }),
            IpcResponse::Error { message } => Err(DaemonError::Ipc(message)),
            other => Err(DaemonError::Ipc(format!("Unexpected response: {:?}", other))),
        }
    }
}

/// Stream of commands pushed to a subscribed host
pub struct HostSubscription {
    lines: Lines<BufReader<ReadHalf<ClientStream>>>,
}

impl HostSubscription {
    /// Next command, or `None` once the daemon closes the connection
    pub async fn next(&mut self) -> Result<Option<HostCommand>> {
        while let Some(line) = self.lines.next_line().await? {
            if let IpcResponse::Command { command } = serde_json::from_str(&line)? {
                return Ok(Some(command));
            }
        }
        Ok(None)
    }
}
