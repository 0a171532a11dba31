//! CSI Node service.
//!
//! The Node service runs on each worker node and handles the local steps
//! that make a volume available to workloads:
//!
//! 1. **Stage**: prepare the volume at a node-global staging path.
//! 2. **Publish**: expose the staged volume at a workload target path.
//! 3. **Unpublish**: remove the target path mount.
//! 4. **Unstage**: tear down the staging path.
//!
//! The per-volume state lives in the [`Mounter`]; this service validates
//! requests and reports the node identity.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use crate::backend::{HostIdentity, Mounter};
use crate::driver::Driver;
use crate::error::{CsiError, respond};
use crate::proto;
use crate::proto::node_server::Node;
use crate::proto::node_service_capability::rpc::Type as NodeRpc;
use crate::types::*;

/// Host part used when no host name can be determined.
pub const UNKNOWN_HOST: &str = "unknown";

/// Node service bound to a [`Driver`], a [`Mounter`] and a [`HostIdentity`].
#[derive(Clone)]
pub struct NodeService {
    driver: Arc<Driver>,
    mounter: Arc<dyn Mounter>,
    host: Arc<dyn HostIdentity>,
}

fn require(value: &str, field: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        return Err(CsiError::invalid(format!("{field} must be provided")));
    }
    Ok(())
}

fn require_capability(cap: Option<&proto::VolumeCapability>) -> Result<VolumeCapability, CsiError> {
    let cap = cap.ok_or_else(|| CsiError::invalid("volume capability must be provided"))?;
    VolumeCapability::try_from(cap)
}

fn clean_host_name(raw: &str) -> Option<String> {
    let name = raw.trim_end_matches('\n').trim();
    (!name.is_empty()).then(|| name.to_owned())
}

impl NodeService {
    pub fn new(driver: Arc<Driver>, mounter: Arc<dyn Mounter>, host: Arc<dyn HostIdentity>) -> Self {
        Self {
            driver,
            mounter,
            host,
        }
    }

    fn ensure(&self, rpc: NodeRpc) -> Result<(), CsiError> {
        self.driver.capabilities().require_node(rpc)
    }

    /// FQDN, else the secondary host name, else [`UNKNOWN_HOST`].
    async fn host_name(&self) -> String {
        match self.host.fqdn().await {
            Ok(raw) => match clean_host_name(&raw) {
                Some(name) => return name,
                None => warn!("fqdn lookup returned nothing, trying host name"),
            },
            Err(e) => warn!(error = %e, "fqdn lookup failed, trying host name"),
        }
        match self.host.hostname().await {
            Ok(raw) => match clean_host_name(&raw) {
                Some(name) => return name,
                None => warn!("host name is empty, using {UNKNOWN_HOST}"),
            },
            Err(e) => warn!(error = %e, "host name lookup failed, using {UNKNOWN_HOST}"),
        }
        UNKNOWN_HOST.to_owned()
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id))]
    async fn do_stage_volume(
        &self,
        req: proto::NodeStageVolumeRequest,
    ) -> Result<proto::NodeStageVolumeResponse, CsiError> {
        info!("NodeStageVolume started");
        self.ensure(NodeRpc::StageUnstageVolume)?;
        require(&req.volume_id, "volume id")?;
        let capability = require_capability(req.volume_capability.as_ref())?;
        require(&req.staging_target_path, "staging target path")?;

        self.mounter
            .stage(StageRequest {
                volume_id: VolumeId(req.volume_id),
                staging_target_path: PathBuf::from(req.staging_target_path),
                capability,
                volume_context: req.volume_context,
                publish_context: req.publish_context,
            })
            .await?;
        info!("NodeStageVolume finished");
        Ok(proto::NodeStageVolumeResponse {})
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id))]
    async fn do_unstage_volume(
        &self,
        req: proto::NodeUnstageVolumeRequest,
    ) -> Result<proto::NodeUnstageVolumeResponse, CsiError> {
        info!("NodeUnstageVolume started");
        self.ensure(NodeRpc::StageUnstageVolume)?;
        require(&req.volume_id, "volume id")?;
        require(&req.staging_target_path, "staging target path")?;

        self.mounter
            .unstage(
                &VolumeId(req.volume_id),
                &PathBuf::from(req.staging_target_path),
            )
            .await?;
        info!("NodeUnstageVolume finished");
        Ok(proto::NodeUnstageVolumeResponse {})
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id, target_path = %req.target_path))]
    async fn do_publish_volume(
        &self,
        req: proto::NodePublishVolumeRequest,
    ) -> Result<proto::NodePublishVolumeResponse, CsiError> {
        info!("NodePublishVolume started");
        require(&req.volume_id, "volume id")?;
        require(&req.staging_target_path, "staging target path")?;
        let capability = require_capability(req.volume_capability.as_ref())?;
        require(&req.target_path, "target path")?;

        self.mounter
            .publish(PublishRequest {
                volume_id: VolumeId(req.volume_id),
                staging_target_path: PathBuf::from(req.staging_target_path),
                target_path: PathBuf::from(req.target_path),
                capability,
                read_only: req.readonly,
                volume_context: req.volume_context,
            })
            .await?;
        info!("NodePublishVolume finished");
        Ok(proto::NodePublishVolumeResponse {})
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id, target_path = %req.target_path))]
    async fn do_unpublish_volume(
        &self,
        req: proto::NodeUnpublishVolumeRequest,
    ) -> Result<proto::NodeUnpublishVolumeResponse, CsiError> {
        info!("NodeUnpublishVolume started");
        require(&req.target_path, "target path")?;
        require(&req.volume_id, "volume id")?;

        self.mounter
            .unpublish(&VolumeId(req.volume_id), &PathBuf::from(req.target_path))
            .await?;
        info!("NodeUnpublishVolume finished");
        Ok(proto::NodeUnpublishVolumeResponse {})
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id))]
    async fn do_expand_volume(
        &self,
        req: proto::NodeExpandVolumeRequest,
    ) -> Result<proto::NodeExpandVolumeResponse, CsiError> {
        info!("NodeExpandVolume started");
        self.ensure(NodeRpc::ExpandVolume)?;
        require(&req.volume_id, "volume id")?;
        require_capability(req.volume_capability.as_ref())?;
        require(&req.staging_target_path, "staging target path")?;
        let range = req
            .capacity_range
            .as_ref()
            .map(CapacityRange::try_from)
            .transpose()?;

        let volume_path = if req.volume_path.is_empty() {
            req.staging_target_path
        } else {
            req.volume_path
        };
        let capacity_bytes = self
            .mounter
            .expand(&VolumeId(req.volume_id), &PathBuf::from(volume_path), range)
            .await?;
        info!(capacity_bytes, "NodeExpandVolume finished");
        Ok(proto::NodeExpandVolumeResponse { capacity_bytes })
    }

    async fn do_get_info(&self) -> proto::NodeGetInfoResponse {
        let looked_up = self.host_name().await;
        let configured = self.driver.node_id();
        // The topology segment names the same host as the node id.
        let (host, node_id) = match NodeId::new(looked_up.as_str(), configured) {
            Ok(node) => (looked_up, node.to_string()),
            Err(e) => {
                warn!(error = %e, host = %looked_up, "host name cannot form a node id, using {UNKNOWN_HOST}");
                (
                    UNKNOWN_HOST.to_owned(),
                    format!("{UNKNOWN_HOST}{NODE_ID_SEPARATOR}{configured}"),
                )
            }
        };
        debug!(%node_id, "NodeGetInfo");

        let topology_key = format!("topology.{}/node", self.driver.name());
        proto::NodeGetInfoResponse {
            node_id,
            max_volumes_per_node: self.driver.max_volumes_per_node(),
            accessible_topology: Some(proto::Topology {
                segments: HashMap::from([(topology_key, host)]),
            }),
        }
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<proto::NodeStageVolumeRequest>,
    ) -> Result<Response<proto::NodeStageVolumeResponse>, Status> {
        respond(self.do_stage_volume(request.into_inner()).await)
    }

    async fn node_unstage_volume(
        &self,
        request: Request<proto::NodeUnstageVolumeRequest>,
    ) -> Result<Response<proto::NodeUnstageVolumeResponse>, Status> {
        respond(self.do_unstage_volume(request.into_inner()).await)
    }

    async fn node_publish_volume(
        &self,
        request: Request<proto::NodePublishVolumeRequest>,
    ) -> Result<Response<proto::NodePublishVolumeResponse>, Status> {
        respond(self.do_publish_volume(request.into_inner()).await)
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<proto::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<proto::NodeUnpublishVolumeResponse>, Status> {
        respond(self.do_unpublish_volume(request.into_inner()).await)
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<proto::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<proto::NodeGetVolumeStatsResponse>, Status> {
        respond(Err(CsiError::unimplemented("NodeGetVolumeStats")))
    }

    async fn node_expand_volume(
        &self,
        request: Request<proto::NodeExpandVolumeRequest>,
    ) -> Result<Response<proto::NodeExpandVolumeResponse>, Status> {
        respond(self.do_expand_volume(request.into_inner()).await)
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<proto::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<proto::NodeGetCapabilitiesResponse>, Status> {
        respond(Ok(proto::NodeGetCapabilitiesResponse {
            capabilities: self.driver.capabilities().node_capabilities(),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<proto::NodeGetInfoRequest>,
    ) -> Result<Response<proto::NodeGetInfoResponse>, Status> {
        Ok(Response::new(self.do_get_info().await))
    }
}
