//! Privileged-helper backend
//!
//! A helper with system privileges connects to a dedicated socket and writes
//! one JSON [`ForegroundReport`] per line whenever the top activity changes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use applock_core::PackageName;

use super::{Clock, ForegroundEvent, ForegroundSource};
use crate::config::Backend;
use crate::error::Result;
use crate::ipc::{PlatformListener, SocketListener};

/// Line written by the privileged helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForegroundReport {
    pub package: String,
}

pub struct PrivilegedIpcSource {
    socket_path: PathBuf,
    clock: Arc<dyn Clock>,
    ignored: Arc<BTreeSet<String>>,
}

impl PrivilegedIpcSource {
    pub fn new(socket_path: PathBuf, clock: Arc<dyn Clock>, ignored: Arc<BTreeSet<String>>) -> Self {
        Self {
            socket_path,
            clock,
            ignored,
        }
    }
}

#[async_trait]
impl ForegroundSource for PrivilegedIpcSource {
    fn backend(&self) -> Backend {
        Backend::PrivilegedIpc
    }

    async fn run(self: Box<Self>, sink: mpsc::Sender<ForegroundEvent>) -> Result<()> {
        let transport = PlatformListener::bind(&self.socket_path).await?;
        info!("Privileged foreground source listening on {:?}", self.socket_path);

        let (report_tx, mut report_rx) = mpsc::channel::<PackageName>(64);
        let mut last: Option<PackageName> = None;

        loop {
            tokio::select! {
                accepted = transport.accept() => match accepted {
                    Ok(stream) => {
                        let report_tx = report_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = read_reports(stream, report_tx).await {
                                error!("Privileged connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
                Some(package) = report_rx.recv() => {
                    if self.ignored.contains(package.as_str()) || last.as_ref() == Some(&package) {
                        continue;
                    }
                    last = Some(package.clone());
                    let event = ForegroundEvent {
                        package,
                        timestamp: self.clock.now(),
                        backend: Backend::PrivilegedIpc,
                    };
                    if sink.send(event).await.is_err() {
                        break;
                    }
                }
                _ = sink.closed() => break,
            }
        }

        transport.remove_socket().await
    }
}

/// Forward every valid report on one connection
async fn read_reports<S>(stream: S, reports: mpsc::Sender<PackageName>) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let report: ForegroundReport = match serde_json::from_str(&line) {
            Ok(report) => report,
            Err(e) => {
                warn!("Invalid foreground report: {}", e);
                continue;
            }
        };
        match PackageName::new(report.package) {
            Ok(package) => {
                if reports.send(package).await.is_err() {
                    break;
                }
            }
            Err(e) => debug!("Skipping foreground report: {}", e),
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::foreground::MonotonicClock;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn test_reports_become_events() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("privileged.sock");
        let ignored = ["com.android.systemui".to_string()].into_iter().collect();
        let source = Box::new(PrivilegedIpcSource::new(
            path.clone(),
            Arc::new(MonotonicClock::new()),
            Arc::new(ignored),
        ));

        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(source.run(tx));

        let mut stream = loop {
            match UnixStream::connect(&path).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };
        stream
            .write_all(
                b"{\"package\":\"com.example.bank\"}\n\
                  not json\n\
                  {\"package\":\"com.example.bank\"}\n\
                  {\"package\":\"com.android.systemui\"}\n\
                  {\"package\":\"com.example.mail\"}\n",
            )
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.package, "com.example.bank");
        assert_eq!(first.backend, Backend::PrivilegedIpc);
        assert_eq!(rx.recv().await.unwrap().package, "com.example.mail");

        drop(rx);
        task.await.unwrap().unwrap();
        assert!(!path.exists());
    }
}
