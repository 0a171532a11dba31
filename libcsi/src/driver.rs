//! Driver: plugin identity, capability registry and service composition.

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::backend::{Backends, HostIdentity, Mounter, Provisioner};
use crate::capability::CapabilityRegistry;
use crate::controller::ControllerService;
use crate::error::CsiError;
use crate::identity::IdentityService;
use crate::node::NodeService;
use crate::transport::{Endpoint, NonBlockingServer};
use crate::types::NODE_ID_SEPARATOR;

/// Version reported by `GetPluginInfo` unless configured otherwise.
pub const DEFAULT_VERSION: &str = "1.0";

/// Construction parameters of a [`Driver`].
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Configured node id; the host name is prepended by `NodeGetInfo`.
    pub node_id: String,
    /// Plugin name, e.g. `csi.example.com`.
    pub driver_name: String,
    /// `unix://...` or `tcp://...`.
    pub endpoint: String,
    pub version: String,
    /// Mode of directories created by the host mounter; 0 leaves it alone.
    pub mount_permissions: u32,
    /// Reported by `NodeGetInfo`; 0 means no limit.
    pub max_volumes_per_node: i64,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            driver_name: String::new(),
            endpoint: String::new(),
            version: DEFAULT_VERSION.to_owned(),
            mount_permissions: 0,
            max_volumes_per_node: 0,
        }
    }
}

/// Validated plugin configuration shared by the three services.
///
/// Nothing in a driver changes after construction.
#[derive(Debug)]
pub struct Driver {
    node_id: String,
    name: String,
    version: String,
    endpoint: Endpoint,
    mount_permissions: u32,
    max_volumes_per_node: i64,
    capabilities: CapabilityRegistry,
}

impl Driver {
    /// Validate `opts` and build the driver.
    ///
    /// Fails with [`CsiError::Config`] when the node id, driver name or
    /// endpoint is empty, when the node id contains the node-id separator, or
    /// when the endpoint does not parse.
    pub fn new(opts: DriverOptions) -> Result<Arc<Self>, CsiError> {
        Self::with_capabilities(opts, CapabilityRegistry::default())
    }

    /// Like [`Self::new`] with a custom capability registry.  RPCs missing
    /// from `capabilities` answer `Unimplemented`.
    pub fn with_capabilities(
        opts: DriverOptions,
        capabilities: CapabilityRegistry,
    ) -> Result<Arc<Self>, CsiError> {
        if opts.node_id.is_empty() {
            return Err(CsiError::Config("node id must be set".into()));
        }
        if opts.node_id.contains(NODE_ID_SEPARATOR) {
            return Err(CsiError::Config(format!(
                "node id {:?} must not contain {NODE_ID_SEPARATOR:?}",
                opts.node_id
            )));
        }
        if opts.driver_name.is_empty() {
            return Err(CsiError::Config("driver name must be set".into()));
        }
        if opts.endpoint.is_empty() {
            return Err(CsiError::Config("endpoint must be set".into()));
        }
        if opts.max_volumes_per_node < 0 {
            return Err(CsiError::Config(
                "max volumes per node must not be negative".into(),
            ));
        }
        let endpoint: Endpoint = opts.endpoint.parse()?;

        info!(
            name = %opts.driver_name,
            node_id = %opts.node_id,
            version = %opts.version,
            %endpoint,
            "driver initialized",
        );
        Ok(Arc::new(Self {
            node_id: opts.node_id,
            name: opts.driver_name,
            version: opts.version,
            endpoint,
            mount_permissions: opts.mount_permissions,
            max_volumes_per_node: opts.max_volumes_per_node,
            capabilities,
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn mount_permissions(&self) -> u32 {
        self.mount_permissions
    }

    pub fn max_volumes_per_node(&self) -> i64 {
        self.max_volumes_per_node
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn identity_service(self: &Arc<Self>) -> IdentityService {
        IdentityService::new(Arc::clone(self))
    }

    pub fn controller_service(self: &Arc<Self>, provisioner: Arc<dyn Provisioner>) -> ControllerService {
        ControllerService::new(Arc::clone(self), provisioner)
    }

    pub fn node_service(
        self: &Arc<Self>,
        mounter: Arc<dyn Mounter>,
        host: Arc<dyn HostIdentity>,
    ) -> NodeService {
        NodeService::new(Arc::clone(self), mounter, host)
    }

    /// Start serving all three services on the configured endpoint.
    ///
    /// Returns once the endpoint is listening.
    pub async fn start(self: &Arc<Self>, backends: Backends) -> Result<NonBlockingServer, CsiError> {
        NonBlockingServer::start(
            &self.endpoint,
            self.identity_service(),
            self.controller_service(backends.provisioner),
            self.node_service(backends.mounter, backends.host),
        )
        .await
    }

    /// Serve until `shutdown` resolves or the server fails.
    pub async fn run<F>(self: &Arc<Self>, backends: Backends, shutdown: F) -> Result<(), CsiError>
    where
        F: Future<Output = ()>,
    {
        let server = self.start(backends).await?;
        let stop = server.shutdown_handle();
        let wait = server.wait();
        tokio::pin!(wait);

        tokio::select! {
            result = &mut wait => return result,
            () = shutdown => {
                info!("shutdown requested");
                stop.stop();
            }
        }
        wait.await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_options() -> DriverOptions {
        DriverOptions {
            node_id: "node-1".into(),
            driver_name: "csi.example.com".into(),
            endpoint: "tcp://127.0.0.1:0".into(),
            ..Default::default()
        }
    }

    pub(crate) fn test_driver() -> Arc<Driver> {
        Driver::new(test_options()).unwrap()
    }

    #[test]
    fn construction_validates_options() {
        let driver = test_driver();
        assert_eq!(driver.node_id(), "node-1");
        assert_eq!(driver.version(), DEFAULT_VERSION);
        assert_eq!(driver.capabilities(), &CapabilityRegistry::default());
        let driver = Driver::new(DriverOptions {
            mount_permissions: 0o750,
            ..test_options()
        })
        .unwrap();
        assert_eq!(driver.mount_permissions(), 0o750);

        let cases: [fn(&mut DriverOptions); 6] = [
            |o| o.node_id.clear(),
            |o| o.driver_name.clear(),
            |o| o.endpoint.clear(),
            |o| o.node_id = "a$$b".into(),
            |o| o.endpoint = "http://nope".into(),
            |o| o.max_volumes_per_node = -1,
        ];
        for mutate in cases {
            let mut opts = test_options();
            mutate(&mut opts);
            let err = Driver::new(opts).unwrap_err();
            assert!(matches!(err, CsiError::Config(_)), "{err}");
        }
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_future() {
        let driver = test_driver();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let run = tokio::spawn({
            let driver = driver.clone();
            async move {
                driver
                    .run(Backends::in_memory(), async {
                        let _ = rx.await;
                    })
                    .await
            }
        });
        tx.send(()).unwrap();
        run.await.unwrap().unwrap();
    }
}
