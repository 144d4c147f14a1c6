//! Service wiring.
//!
//! Assembles the broker, the streaming registry (inside the broker),
//! and the control server into a running service. Both the binary and
//! the integration tests go through [`Daemon::spawn`], so the tests
//! exercise the same composition the binary ships.

use std::path::{Path, PathBuf};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::broker::{Broker, BrokerConfig, BrokerHandle};
use crate::control::ControlServer;
use crate::source::TraceSource;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path of the named control channel socket.
    pub control_pipe: PathBuf,
    /// Prefix for per-pid shared frame channel names.
    pub nsm_prefix: String,
    /// Name of the introspection region advertised to clients.
    pub intro_nsm: String,
    /// Whether the test-control command surface is enabled.
    pub enable_test_control: bool,
}

/// A running service instance.
pub struct Daemon {
    socket_path: PathBuf,
    broker: BrokerHandle,
    shutdown: watch::Sender<bool>,
    server_task: JoinHandle<()>,
    broker_task: JoinHandle<()>,
}

impl Daemon {
    /// Binds the control channel and starts the broker and server
    /// tasks. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the IO error when the control socket cannot be bound.
    pub fn spawn(config: DaemonConfig, source: Box<dyn TraceSource>) -> std::io::Result<Self> {
        let server = ControlServer::bind(&config.control_pipe)?;
        let socket_path = server.path().to_owned();

        let (broker, handle) = Broker::new(
            BrokerConfig {
                nsm_prefix: config.nsm_prefix,
                intro_nsm: config.intro_nsm,
                enable_test_control: config.enable_test_control,
            },
            source,
        );
        let broker_task = tokio::spawn(broker.run());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let server_broker = handle.clone();
        let server_task = tokio::spawn(server.run(server_broker, shutdown_rx));

        info!(socket = %socket_path.display(), "service started");
        Ok(Self {
            socket_path,
            broker: handle,
            shutdown,
            server_task,
            broker_task,
        })
    }

    /// Path of the bound control socket.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The broker handle, for in-process clients.
    #[must_use]
    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    /// Stops accepting connections, closes every stream, and waits
    /// for both tasks to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.server_task.await;
        self.broker.shutdown().await;
        let _ = self.broker_task.await;
        info!("service stopped");
    }
}
