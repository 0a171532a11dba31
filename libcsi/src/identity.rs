//! CSI Identity service.
//!
//! The Identity service allows callers to discover plugin metadata and check
//! plugin health.  Every CSI plugin must implement this service.

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::debug;

use crate::driver::Driver;
use crate::error::respond;
use crate::proto;
use crate::proto::identity_server::Identity;
use crate::proto::plugin_capability::{self, service, volume_expansion};

/// Identity service bound to a [`Driver`].
#[derive(Clone)]
pub struct IdentityService {
    driver: Arc<Driver>,
}

impl IdentityService {
    pub fn new(driver: Arc<Driver>) -> Self {
        Self { driver }
    }

    /// Capabilities announced by `GetPluginCapabilities`.
    pub fn plugin_capabilities() -> Vec<proto::PluginCapability> {
        let svc = |t: service::Type| proto::PluginCapability {
            r#type: Some(plugin_capability::Type::Service(plugin_capability::Service {
                r#type: t as i32,
            })),
        };
        vec![
            svc(service::Type::ControllerService),
            svc(service::Type::VolumeAccessibilityConstraints),
            proto::PluginCapability {
                r#type: Some(plugin_capability::Type::VolumeExpansion(
                    plugin_capability::VolumeExpansion {
                        r#type: volume_expansion::Type::Online as i32,
                    },
                )),
            },
        ]
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<proto::GetPluginInfoRequest>,
    ) -> Result<Response<proto::GetPluginInfoResponse>, Status> {
        debug!(name = self.driver.name(), "GetPluginInfo");
        respond(Ok(proto::GetPluginInfoResponse {
            name: self.driver.name().to_owned(),
            vendor_version: self.driver.version().to_owned(),
            manifest: HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<proto::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<proto::GetPluginCapabilitiesResponse>, Status> {
        respond(Ok(proto::GetPluginCapabilitiesResponse {
            capabilities: Self::plugin_capabilities(),
        }))
    }

    async fn probe(
        &self,
        _request: Request<proto::ProbeRequest>,
    ) -> Result<Response<proto::ProbeResponse>, Status> {
        // A driver only exists once construction succeeded.
        respond(Ok(proto::ProbeResponse { ready: Some(true) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::tests::test_driver;

    #[tokio::test]
    async fn plugin_info() {
        let svc = IdentityService::new(test_driver());
        let info = svc
            .get_plugin_info(Request::new(proto::GetPluginInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.name, "csi.example.com");
        assert_eq!(info.vendor_version, "1.0");
        assert!(info.manifest.is_empty());
    }

    #[tokio::test]
    async fn probe_is_ready() {
        let svc = IdentityService::new(test_driver());
        let resp = svc
            .probe(Request::new(proto::ProbeRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.ready, Some(true));
    }

    #[tokio::test]
    async fn capabilities() {
        let svc = IdentityService::new(test_driver());
        let caps = svc
            .get_plugin_capabilities(Request::new(proto::GetPluginCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner()
            .capabilities;
        assert_eq!(caps.len(), 3);
        assert!(caps.iter().any(|c| matches!(
            c.r#type,
            Some(plugin_capability::Type::VolumeExpansion(_))
        )));
    }
}
