//! CSI Controller service.
//!
//! The Controller service manages the cluster-wide volume lifecycle:
//! creation, deletion, attachment to nodes, capability validation, listing,
//! snapshots and expansion.  Every request is fully validated before the
//! [`Provisioner`] is called, so an invalid request never has a side effect.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument};

use crate::backend::Provisioner;
use crate::capability::{CapabilityKind, validate_capabilities};
use crate::driver::Driver;
use crate::error::{CsiError, respond};
use crate::proto;
use crate::proto::controller_server::Controller;
use crate::proto::controller_service_capability::rpc::Type as ControllerRpc;
use crate::types::*;

/// Controller service bound to a [`Driver`] and a [`Provisioner`].
#[derive(Clone)]
pub struct ControllerService {
    driver: Arc<Driver>,
    provisioner: Arc<dyn Provisioner>,
}

fn require(value: &str, field: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        return Err(CsiError::invalid(format!("{field} must be provided")));
    }
    Ok(())
}

fn capacity_range(range: Option<&proto::CapacityRange>) -> Result<Option<CapacityRange>, CsiError> {
    range.map(CapacityRange::try_from).transpose()
}

impl ControllerService {
    pub fn new(driver: Arc<Driver>, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            driver,
            provisioner,
        }
    }

    fn ensure(&self, rpc: ControllerRpc) -> Result<(), CsiError> {
        self.driver.capabilities().require_controller(rpc)
    }

    #[instrument(skip_all, fields(name = %req.name))]
    async fn do_create_volume(
        &self,
        req: proto::CreateVolumeRequest,
    ) -> Result<proto::CreateVolumeResponse, CsiError> {
        info!("CreateVolume started");
        self.ensure(ControllerRpc::CreateDeleteVolume)?;
        require(&req.name, "name")?;
        if req.parameters.is_empty() {
            return Err(CsiError::invalid("parameters must be provided"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::invalid("volume capabilities must be provided"));
        }
        let validated = validate_capabilities(&req.volume_capabilities)?;
        debug!(kind = ?validated.kind, "capabilities validated");
        let capacity_range = capacity_range(req.capacity_range.as_ref())?;
        let content_source = req
            .volume_content_source
            .as_ref()
            .and_then(ContentSource::from_proto);
        if matches!(content_source, Some(ContentSource::Volume(_))) {
            self.ensure(ControllerRpc::CloneVolume)?;
        }

        let accessibility: Vec<Topology> = req
            .accessibility_requirements
            .as_ref()
            .map(|t| t.preferred.iter().chain(&t.requisite).map(Topology::from).collect())
            .unwrap_or_default();
        let domain = CreateVolumeRequest {
            name: req.name,
            capacity_range,
            volume_capabilities: validated.capabilities,
            parameters: req.parameters,
            content_source,
            accessibility,
        };

        let volume = self.provisioner.create(domain).await?;
        info!(volume_id = %volume.volume_id, "CreateVolume finished");
        Ok(proto::CreateVolumeResponse {
            volume: Some(proto::Volume::from(&volume)),
        })
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id))]
    async fn do_delete_volume(
        &self,
        req: proto::DeleteVolumeRequest,
    ) -> Result<proto::DeleteVolumeResponse, CsiError> {
        info!("DeleteVolume started");
        self.ensure(ControllerRpc::CreateDeleteVolume)?;
        require(&req.volume_id, "volume id")?;
        self.provisioner.delete(&VolumeId(req.volume_id)).await?;
        info!("DeleteVolume finished");
        Ok(proto::DeleteVolumeResponse {})
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn do_publish_volume(
        &self,
        req: proto::ControllerPublishVolumeRequest,
    ) -> Result<proto::ControllerPublishVolumeResponse, CsiError> {
        info!("ControllerPublishVolume started");
        self.ensure(ControllerRpc::PublishUnpublishVolume)?;
        let Some(capability) = req.volume_capability.as_ref() else {
            return Err(CsiError::invalid("volume capability must be provided"));
        };
        require(&req.volume_id, "volume id")?;
        require(&req.node_id, "node id")?;
        let node_id: NodeId = req
            .node_id
            .parse()
            .map_err(|e| CsiError::NotFound(format!("node id does not follow '<fqdn>$$<id>': {e}")))?;
        VolumeCapability::try_from(capability)?;

        let publish_context = self
            .provisioner
            .attach(&VolumeId(req.volume_id), &node_id, req.readonly)
            .await?;
        info!("ControllerPublishVolume finished");
        Ok(proto::ControllerPublishVolumeResponse { publish_context })
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn do_unpublish_volume(
        &self,
        req: proto::ControllerUnpublishVolumeRequest,
    ) -> Result<proto::ControllerUnpublishVolumeResponse, CsiError> {
        info!("ControllerUnpublishVolume started");
        self.ensure(ControllerRpc::PublishUnpublishVolume)?;
        require(&req.volume_id, "volume id")?;
        let volume_id = VolumeId(req.volume_id);

        if req.node_id.is_empty() {
            self.provisioner.detach(&volume_id, None).await?;
        } else {
            match req.node_id.parse::<NodeId>() {
                Ok(node_id) => self.provisioner.detach(&volume_id, Some(&node_id)).await?,
                // A malformed id was never accepted by publish.
                Err(e) => debug!(error = %e, "node id cannot be published to, nothing to do"),
            }
        }
        info!("ControllerUnpublishVolume finished");
        Ok(proto::ControllerUnpublishVolumeResponse {})
    }

    /// Missing fields, malformed entries and an unknown volume are errors.
    /// A well-formed list the plugin cannot serve, such as one mixing block
    /// and file access, is answered with success, no `confirmed` block and
    /// the reason in `message`; CreateVolume rejects the same list with
    /// InvalidArgument.  Advisories on an accepted list are reported in
    /// `message` next to `confirmed`.
    #[instrument(skip_all, fields(volume_id = %req.volume_id))]
    async fn do_validate_volume_capabilities(
        &self,
        req: proto::ValidateVolumeCapabilitiesRequest,
    ) -> Result<proto::ValidateVolumeCapabilitiesResponse, CsiError> {
        require(&req.volume_id, "volume id")?;
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::invalid("volume capabilities must be provided"));
        }
        for cap in &req.volume_capabilities {
            VolumeCapability::try_from(cap)?;
        }

        let volume_id = VolumeId(req.volume_id);
        if self.provisioner.get(&volume_id).await?.is_none() {
            return Err(CsiError::VolumeNotFound(volume_id.to_string()));
        }

        let validated = match validate_capabilities(&req.volume_capabilities) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "capabilities not supported");
                return Ok(proto::ValidateVolumeCapabilitiesResponse {
                    confirmed: None,
                    message: e.to_string(),
                });
            }
        };

        Ok(proto::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(proto::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
                mutable_parameters: req.mutable_parameters,
            }),
            message: validated.advisories.join("; "),
        })
    }

    async fn do_list_volumes(
        &self,
        req: proto::ListVolumesRequest,
    ) -> Result<proto::ListVolumesResponse, CsiError> {
        use proto::list_volumes_response::{Entry, VolumeStatus};

        self.ensure(ControllerRpc::ListVolumes)?;
        let page = PageRequest::from_wire(req.max_entries, &req.starting_token)?;
        let page = self.provisioner.list(&page).await?;
        debug!(count = page.entries.len(), "ListVolumes");
        Ok(proto::ListVolumesResponse {
            entries: page
                .entries
                .iter()
                .map(|e| Entry {
                    volume: Some(proto::Volume::from(&e.volume)),
                    status: Some(VolumeStatus {
                        published_node_ids: e.published_nodes.clone(),
                        volume_condition: None,
                    }),
                })
                .collect(),
            next_token: page.next_token.unwrap_or_default(),
        })
    }

    #[instrument(skip_all, fields(source = %req.source_volume_id, name = %req.name))]
    async fn do_create_snapshot(
        &self,
        req: proto::CreateSnapshotRequest,
    ) -> Result<proto::CreateSnapshotResponse, CsiError> {
        info!("CreateSnapshot started");
        self.ensure(ControllerRpc::CreateDeleteSnapshot)?;
        require(&req.source_volume_id, "source volume id")?;
        require(&req.name, "name")?;
        let snapshot = self
            .provisioner
            .create_snapshot(&VolumeId(req.source_volume_id), &req.name, &req.parameters)
            .await?;
        info!(snapshot_id = %snapshot.snapshot_id, "CreateSnapshot finished");
        Ok(proto::CreateSnapshotResponse {
            snapshot: Some(proto::Snapshot::from(&snapshot)),
        })
    }

    #[instrument(skip_all, fields(snapshot_id = %req.snapshot_id))]
    async fn do_delete_snapshot(
        &self,
        req: proto::DeleteSnapshotRequest,
    ) -> Result<proto::DeleteSnapshotResponse, CsiError> {
        self.ensure(ControllerRpc::CreateDeleteSnapshot)?;
        require(&req.snapshot_id, "snapshot id")?;
        self.provisioner.delete_snapshot(&req.snapshot_id).await?;
        Ok(proto::DeleteSnapshotResponse {})
    }

    async fn do_list_snapshots(
        &self,
        req: proto::ListSnapshotsRequest,
    ) -> Result<proto::ListSnapshotsResponse, CsiError> {
        self.ensure(ControllerRpc::ListSnapshots)?;
        let page = PageRequest::from_wire(req.max_entries, &req.starting_token)?;
        let filter = SnapshotFilter {
            source_volume_id: (!req.source_volume_id.is_empty())
                .then(|| VolumeId(req.source_volume_id.clone())),
            snapshot_id: (!req.snapshot_id.is_empty()).then(|| req.snapshot_id.clone()),
        };
        let page = self.provisioner.list_snapshots(&filter, &page).await?;
        Ok(proto::ListSnapshotsResponse {
            entries: page
                .entries
                .iter()
                .map(|s| proto::list_snapshots_response::Entry {
                    snapshot: Some(proto::Snapshot::from(s)),
                })
                .collect(),
            next_token: page.next_token.unwrap_or_default(),
        })
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id))]
    async fn do_expand_volume(
        &self,
        req: proto::ControllerExpandVolumeRequest,
    ) -> Result<proto::ControllerExpandVolumeResponse, CsiError> {
        info!("ControllerExpandVolume started");
        self.ensure(ControllerRpc::ExpandVolume)?;
        require(&req.volume_id, "volume id")?;
        let range = capacity_range(req.capacity_range.as_ref())?
            .ok_or_else(|| CsiError::invalid("capacity range must be provided"))?;
        if range.is_empty() {
            return Err(CsiError::invalid("capacity range must request a size"));
        }
        let block = match req.volume_capability.as_ref() {
            Some(cap) => validate_capabilities(std::slice::from_ref(cap))?.kind == CapabilityKind::Block,
            None => false,
        };

        let capacity_bytes = self
            .provisioner
            .expand(&VolumeId(req.volume_id), range)
            .await?;
        info!(capacity_bytes, "ControllerExpandVolume finished");
        Ok(proto::ControllerExpandVolumeResponse {
            capacity_bytes,
            node_expansion_required: !block,
        })
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<proto::CreateVolumeRequest>,
    ) -> Result<Response<proto::CreateVolumeResponse>, Status> {
        respond(self.do_create_volume(request.into_inner()).await)
    }

    async fn delete_volume(
        &self,
        request: Request<proto::DeleteVolumeRequest>,
    ) -> Result<Response<proto::DeleteVolumeResponse>, Status> {
        respond(self.do_delete_volume(request.into_inner()).await)
    }

    async fn controller_publish_volume(
        &self,
        request: Request<proto::ControllerPublishVolumeRequest>,
    ) -> Result<Response<proto::ControllerPublishVolumeResponse>, Status> {
        respond(self.do_publish_volume(request.into_inner()).await)
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<proto::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<proto::ControllerUnpublishVolumeResponse>, Status> {
        respond(self.do_unpublish_volume(request.into_inner()).await)
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<proto::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<proto::ValidateVolumeCapabilitiesResponse>, Status> {
        respond(self.do_validate_volume_capabilities(request.into_inner()).await)
    }

    async fn list_volumes(
        &self,
        request: Request<proto::ListVolumesRequest>,
    ) -> Result<Response<proto::ListVolumesResponse>, Status> {
        respond(self.do_list_volumes(request.into_inner()).await)
    }

    async fn get_capacity(
        &self,
        _request: Request<proto::GetCapacityRequest>,
    ) -> Result<Response<proto::GetCapacityResponse>, Status> {
        respond(Err(CsiError::unimplemented("GetCapacity")))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<proto::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<proto::ControllerGetCapabilitiesResponse>, Status> {
        respond(Ok(proto::ControllerGetCapabilitiesResponse {
            capabilities: self.driver.capabilities().controller_capabilities(),
        }))
    }

    async fn create_snapshot(
        &self,
        request: Request<proto::CreateSnapshotRequest>,
    ) -> Result<Response<proto::CreateSnapshotResponse>, Status> {
        respond(self.do_create_snapshot(request.into_inner()).await)
    }

    async fn delete_snapshot(
        &self,
        request: Request<proto::DeleteSnapshotRequest>,
    ) -> Result<Response<proto::DeleteSnapshotResponse>, Status> {
        respond(self.do_delete_snapshot(request.into_inner()).await)
    }

    async fn list_snapshots(
        &self,
        request: Request<proto::ListSnapshotsRequest>,
    ) -> Result<Response<proto::ListSnapshotsResponse>, Status> {
        respond(self.do_list_snapshots(request.into_inner()).await)
    }

    async fn controller_expand_volume(
        &self,
        request: Request<proto::ControllerExpandVolumeRequest>,
    ) -> Result<Response<proto::ControllerExpandVolumeResponse>, Status> {
        respond(self.do_expand_volume(request.into_inner()).await)
    }

    async fn controller_get_volume(
        &self,
        _request: Request<proto::ControllerGetVolumeRequest>,
    ) -> Result<Response<proto::ControllerGetVolumeResponse>, Status> {
        respond(Err(CsiError::unimplemented("ControllerGetVolume")))
    }

    async fn controller_modify_volume(
        &self,
        _request: Request<proto::ControllerModifyVolumeRequest>,
    ) -> Result<Response<proto::ControllerModifyVolumeResponse>, Status> {
        respond(Err(CsiError::unimplemented("ControllerModifyVolume")))
    }
}
