//! gRPC server that multiplexes the Identity, Controller and Node services
//! on one endpoint.
//!
//! [`NonBlockingServer::start`] binds the listener and returns as soon as the
//! endpoint accepts connections; serving happens on a spawned task.
//! [`NonBlockingServer::wait`] blocks until that task ends, either after a
//! graceful stop or on a fatal transport error.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::{TcpListener, UnixListener};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::transport::Server;
use tonic::transport::server::Router;
use tracing::{debug, error, info, warn};

use super::endpoint::Endpoint;
use crate::controller::ControllerService;
use crate::error::CsiError;
use crate::identity::IdentityService;
use crate::node::NodeService;
use crate::proto::controller_server::ControllerServer;
use crate::proto::identity_server::IdentityServer;
use crate::proto::node_server::NodeServer;

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// Triggers graceful shutdown of a [`NonBlockingServer`].
///
/// Cloneable; the first [`ShutdownHandle::stop`] wins.  When the last handle
/// is dropped the server shuts down as well.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ShutdownHandle {
    /// Ask the server to stop accepting connections and drain.
    pub fn stop(&self) {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            // The receiver is gone only if the server already exited.
            let _ = tx.send(());
        }
    }
}

/// A running gRPC server.
pub struct NonBlockingServer {
    local: Endpoint,
    shutdown: ShutdownHandle,
    task: JoinHandle<Result<(), CsiError>>,
}

impl NonBlockingServer {
    /// Bind `endpoint`, register the three services and start serving in the
    /// background.
    ///
    /// For Unix sockets a stale socket file is removed and the parent
    /// directory created first.  For TCP, port 0 picks a free port; see
    /// [`Self::local_endpoint`].
    pub async fn start(
        endpoint: &Endpoint,
        identity: IdentityService,
        controller: ControllerService,
        node: NodeService,
    ) -> Result<Self, CsiError> {
        let (listener, local) = bind(endpoint).await?;
        let (tx, rx) = oneshot::channel::<()>();

        let router = Server::builder()
            .add_service(IdentityServer::new(identity))
            .add_service(ControllerServer::new(controller))
            .add_service(NodeServer::new(node));

        info!(endpoint = %local, "CSI gRPC server listening");
        let task = tokio::spawn(serve(router, listener, local.clone(), rx));

        Ok(Self {
            local,
            shutdown: ShutdownHandle {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            task,
        })
    }

    /// The endpoint actually bound (resolves TCP port 0).
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Request graceful shutdown; pair with [`Self::wait`].
    pub fn stop(&self) {
        self.shutdown.stop();
    }

    /// Block until the server task ends.
    pub async fn wait(self) -> Result<(), CsiError> {
        let Self { task, shutdown, .. } = self;
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(CsiError::internal(format!("server task failed: {e}"))),
        };
        drop(shutdown);
        result
    }
}

async fn bind(endpoint: &Endpoint) -> Result<(Listener, Endpoint), CsiError> {
    match endpoint {
        Endpoint::Unix(path) => {
            prepare_socket_path(path).await?;
            let listener = UnixListener::bind(path)
                .map_err(|e| CsiError::transport(format!("bind {}: {e}", path.display())))?;
            Ok((Listener::Unix(listener), endpoint.clone()))
        }
        Endpoint::Tcp(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| CsiError::transport(format!("bind {addr}: {e}")))?;
            let local: SocketAddr = listener.local_addr().map_err(CsiError::transport)?;
            Ok((Listener::Tcp(listener), Endpoint::Tcp(local)))
        }
    }
}

async fn prepare_socket_path(path: &Path) -> Result<(), CsiError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(CsiError::transport(format!(
                "remove stale socket {}: {e}",
                path.display()
            )));
        }
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            CsiError::transport(format!("create socket dir {}: {e}", parent.display()))
        })?;
    }
    Ok(())
}

async fn serve(
    router: Router,
    listener: Listener,
    local: Endpoint,
    shutdown: oneshot::Receiver<()>,
) -> Result<(), CsiError> {
    // Resolves on `stop()` and when every handle is dropped.
    let signal = async {
        let _ = shutdown.await;
        info!("CSI gRPC server shutting down");
    };

    let result = match listener {
        Listener::Unix(l) => {
            let incoming = futures::stream::unfold(l, |l| async move {
                let conn = l.accept().await.map(|(stream, _)| stream);
                Some((conn, l))
            });
            router
                .serve_with_incoming_shutdown(Box::pin(incoming), signal)
                .await
        }
        Listener::Tcp(l) => {
            let incoming = futures::stream::unfold(l, |l| async move {
                let conn = l.accept().await.map(|(stream, _)| stream);
                Some((conn, l))
            });
            router
                .serve_with_incoming_shutdown(Box::pin(incoming), signal)
                .await
        }
    };

    if let Endpoint::Unix(path) = &local
        && let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove socket");
    }

    match result {
        Ok(()) => {
            info!(endpoint = %local, "CSI gRPC server stopped");
            Ok(())
        }
        Err(e) => {
            error!(endpoint = %local, error = %e, "CSI gRPC server failed");
            Err(CsiError::transport(e))
        }
    }
}
