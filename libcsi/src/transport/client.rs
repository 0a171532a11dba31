//! gRPC client for a CSI plugin endpoint, used by the `probe` subcommand and
//! the integration tests.

use std::path::PathBuf;

use futures::future::BoxFuture;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::codegen::Service;
use tonic::codegen::http::Uri;
use tonic::transport::Channel;
use tracing::{debug, instrument};

use super::endpoint::Endpoint;
use crate::error::CsiError;
use crate::proto::controller_client::ControllerClient;
use crate::proto::identity_client::IdentityClient;
use crate::proto::node_client::NodeClient;

/// Connector that ignores the URI and dials a Unix socket.
#[derive(Clone)]
struct UnixConnector {
    path: PathBuf,
}

impl Service<Uri> for UnixConnector {
    type Response = TokioIo<UnixStream>;
    type Error = std::io::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let path = self.path.clone();
        Box::pin(async move { UnixStream::connect(path).await.map(TokioIo::new) })
    }
}

/// Clients for all three services sharing one HTTP/2 channel.
#[derive(Clone)]
pub struct CsiClient {
    pub identity: IdentityClient<Channel>,
    pub controller: ControllerClient<Channel>,
    pub node: NodeClient<Channel>,
}

impl CsiClient {
    /// Connect to a plugin listening on `endpoint`.
    #[instrument(skip_all, fields(endpoint = %endpoint))]
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, CsiError> {
        let channel = match endpoint {
            Endpoint::Tcp(addr) => {
                tonic::transport::Endpoint::from_shared(format!("http://{addr}"))
                    .map_err(CsiError::transport)?
                    .connect()
                    .await
                    .map_err(CsiError::transport)?
            }
            Endpoint::Unix(path) => {
                // The authority is unused; the connector dials the socket.
                tonic::transport::Endpoint::from_static("http://localhost")
                    .connect_with_connector(UnixConnector { path: path.clone() })
                    .await
                    .map_err(CsiError::transport)?
            }
        };
        debug!("CSI gRPC channel established");
        Ok(Self::from_channel(channel))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            identity: IdentityClient::new(channel.clone()),
            controller: ControllerClient::new(channel.clone()),
            node: NodeClient::new(channel),
        }
    }
}
