//! Server lifecycle: connect, serve, drain, stop.
//!
//! The lifecycle is the state machine
//! `Uninitialized → Connected → Serving → Draining → Stopped`. The store
//! configuration is supplied exactly once, at `connect`; there is no
//! reconfiguration of a serving endpoint. Shutdown flips the state to
//! Draining and lets tonic finish in-flight calls before the listener is
//! released.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex},
};

use snafu::prelude::*;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::info;

use arrow_flight::flight_service_server::FlightServiceServer;
use hangar_core::store::{StoreConfig, StoreError, TableStore};

use crate::service::HangarFlightService;

/// Lifecycle states of the ingestion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// No store configuration supplied yet.
    Uninitialized,
    /// Store opened; endpoint not yet listening.
    Connected,
    /// Listening and accepting calls.
    Serving,
    /// Shutdown requested; in-flight calls completing.
    Draining,
    /// Listener released.
    Stopped,
}

/// Errors from server startup and shutdown.
#[derive(Debug, Snafu)]
pub enum ServerError {
    /// Opening the table store failed.
    #[snafu(display("Failed to open table store: {source}"))]
    Store {
        /// Underlying store error.
        #[snafu(source, backtrace)]
        source: StoreError,
    },

    /// Binding the listen address failed.
    #[snafu(display("Failed to bind {addr}: {source}"))]
    Bind {
        /// The address that could not be bound.
        addr: SocketAddr,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The transport failed while serving.
    #[snafu(display("Transport error: {source}"))]
    Transport {
        /// Underlying tonic transport error.
        source: tonic::transport::Error,
    },

    /// The serve task panicked or was cancelled.
    #[snafu(display("Server task failed: {source}"))]
    Join {
        /// Underlying join error.
        source: tokio::task::JoinError,
    },
}

/// Ingestion endpoint in the `Connected` state.
pub struct IngestServer {
    store: Arc<TableStore>,
    state: Arc<StdMutex<ServerState>>,
}

impl IngestServer {
    /// Open the table store with `config` (`Uninitialized → Connected`).
    pub async fn connect(config: StoreConfig) -> Result<Self, ServerError> {
        let store = TableStore::open(config).await.context(StoreSnafu)?;
        info!(
            warehouse = %store.config().warehouse_root.display(),
            namespace = %store.config().namespace,
            "store connected"
        );
        Ok(Self {
            store: Arc::new(store),
            state: Arc::new(StdMutex::new(ServerState::Connected)),
        })
    }

    /// The underlying store, shared with the service.
    pub fn store(&self) -> Arc<TableStore> {
        Arc::clone(&self.store)
    }

    /// Bind `addr` and start serving (`Connected → Serving`).
    ///
    /// Returns a handle carrying the bound address (useful with port 0)
    /// and the shutdown trigger.
    pub async fn serve(self, addr: SocketAddr) -> Result<ServerHandle, ServerError> {
        let listener = TcpListener::bind(addr).await.context(BindSnafu { addr })?;
        let local_addr = listener.local_addr().context(BindSnafu { addr })?;

        let service = HangarFlightService::new(Arc::clone(&self.store));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        *self.state.lock().expect("state lock poisoned") = ServerState::Serving;
        info!(addr = %local_addr, "flight server listening");

        let state = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            let drain_state = Arc::clone(&state);
            let result = Server::builder()
                .add_service(FlightServiceServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    // Either an explicit shutdown or the handle being
                    // dropped starts the drain.
                    let _ = shutdown_rx.await;
                    *drain_state.lock().expect("state lock poisoned") = ServerState::Draining;
                    info!("flight server draining");
                })
                .await;

            *state.lock().expect("state lock poisoned") = ServerState::Stopped;
            info!("flight server stopped");
            result
        });

        Ok(ServerHandle {
            addr: local_addr,
            state: self.state,
            store: self.store,
            shutdown: Some(shutdown_tx),
            task,
        })
    }
}

/// Handle to a serving endpoint.
pub struct ServerHandle {
    addr: SocketAddr,
    state: Arc<StdMutex<ServerState>>,
    store: Arc<TableStore>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl ServerHandle {
    /// The bound listen address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// The store behind the endpoint.
    pub fn store(&self) -> Arc<TableStore> {
        Arc::clone(&self.store)
    }

    /// Request a drain and wait for the listener to be released
    /// (`Serving → Draining → Stopped`).
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task
            .await
            .context(JoinSnafu)?
            .context(TransportSnafu)
    }

    /// Wait for the server to stop on its own (e.g. external signal
    /// handling already triggered the drain).
    pub async fn wait(self) -> Result<(), ServerError> {
        self.task
            .await
            .context(JoinSnafu)?
            .context(TransportSnafu)
    }
}
