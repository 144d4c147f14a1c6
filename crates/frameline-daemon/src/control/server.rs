//! Control-channel server.
//!
//! Binds the named Unix domain socket and runs the accept loop. Each
//! accepted connection gets its own task that reads command lines,
//! forwards them to the broker in arrival order, and writes framed
//! replies back. The connection task is also where channel rupture is
//! detected: any read error or EOF without a preceding `quit` is
//! reported to the broker as a rupture, which the broker treats as an
//! immediate disconnect for state purposes.

use std::path::{Path, PathBuf};

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::codec::CommandCodec;
use crate::broker::{BrokerHandle, DisconnectReason};

/// The control-channel listener.
#[derive(Debug)]
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Binds the control socket, replacing a stale socket file left by
    /// a previous instance.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error when the socket cannot be
    /// bound.
    pub fn bind(path: &Path) -> std::io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "control channel bound");
        Ok(Self {
            listener,
            path: path.to_owned(),
        })
    }

    /// The bound socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs the accept loop until `shutdown` flips to true.
    pub async fn run(self, broker: BrokerHandle, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let broker = broker.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, broker).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("control channel shutting down");
                        break;
                    }
                }
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(error = %e, "socket cleanup failed");
        }
    }
}

/// Serves one client connection until quit, rupture, or broker exit.
async fn handle_connection(stream: UnixStream, broker: BrokerHandle) {
    let mut framed = Framed::new(stream, CommandCodec);
    let Ok(session) = broker.connect().await else {
        return;
    };
    debug!(session = %session, "connection accepted");

    let mut reason = DisconnectReason::Rupture;
    while let Some(next) = framed.next().await {
        let line = match next {
            Ok(line) => line,
            Err(e) => {
                warn!(session = %session, error = %e, "control read failed");
                break;
            }
        };
        let Ok(reply) = broker.line(session, line).await else {
            break;
        };
        let close = reply.close;
        if let Err(e) = framed.send(reply.payload).await {
            warn!(session = %session, error = %e, "control write failed");
            break;
        }
        if close {
            reason = DisconnectReason::Graceful;
            break;
        }
    }

    broker.disconnect(session, reason).await;
    debug!(session = %session, ?reason, "connection finished");
}
