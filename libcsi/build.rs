//! Generates the `csi.v1` Identity/Controller/Node service glue.
//!
//! The protobuf messages are declared by hand in `src/proto.rs` (with
//! `prost` derives), so only the service layer is generated here and no
//! `protoc` binary is needed at build time.

use tonic_build::manual::{Builder, Method, Service};

const PACKAGE: &str = "csi.v1";
const CODEC: &str = "tonic::codec::ProstCodec";

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::proto::{input}"))
        .output_type(format!("crate::proto::{output}"))
        .codec_path(CODEC)
        .build()
}

fn identity() -> Service {
    Service::builder()
        .name("Identity")
        .package(PACKAGE)
        .method(unary(
            "get_plugin_info",
            "GetPluginInfo",
            "GetPluginInfoRequest",
            "GetPluginInfoResponse",
        ))
        .method(unary(
            "get_plugin_capabilities",
            "GetPluginCapabilities",
            "GetPluginCapabilitiesRequest",
            "GetPluginCapabilitiesResponse",
        ))
        .method(unary("probe", "Probe", "ProbeRequest", "ProbeResponse"))
        .build()
}

fn controller() -> Service {
    Service::builder()
        .name("Controller")
        .package(PACKAGE)
        .method(unary(
            "create_volume",
            "CreateVolume",
            "CreateVolumeRequest",
            "CreateVolumeResponse",
        ))
        .method(unary(
            "delete_volume",
            "DeleteVolume",
            "DeleteVolumeRequest",
            "DeleteVolumeResponse",
        ))
        .method(unary(
            "controller_publish_volume",
            "ControllerPublishVolume",
            "ControllerPublishVolumeRequest",
            "ControllerPublishVolumeResponse",
        ))
        .method(unary(
            "controller_unpublish_volume",
            "ControllerUnpublishVolume",
            "ControllerUnpublishVolumeRequest",
            "ControllerUnpublishVolumeResponse",
        ))
        .method(unary(
            "validate_volume_capabilities",
            "ValidateVolumeCapabilities",
            "ValidateVolumeCapabilitiesRequest",
            "ValidateVolumeCapabilitiesResponse",
        ))
        .method(unary(
            "list_volumes",
            "ListVolumes",
            "ListVolumesRequest",
            "ListVolumesResponse",
        ))
        .method(unary(
            "get_capacity",
            "GetCapacity",
            "GetCapacityRequest",
            "GetCapacityResponse",
        ))
        .method(unary(
            "controller_get_capabilities",
            "ControllerGetCapabilities",
            "ControllerGetCapabilitiesRequest",
            "ControllerGetCapabilitiesResponse",
        ))
        .method(unary(
            "create_snapshot",
            "CreateSnapshot",
            "CreateSnapshotRequest",
            "CreateSnapshotResponse",
        ))
        .method(unary(
            "delete_snapshot",
            "DeleteSnapshot",
            "DeleteSnapshotRequest",
            "DeleteSnapshotResponse",
        ))
        .method(unary(
            "list_snapshots",
            "ListSnapshots",
            "ListSnapshotsRequest",
            "ListSnapshotsResponse",
        ))
        .method(unary(
            "controller_expand_volume",
            "ControllerExpandVolume",
            "ControllerExpandVolumeRequest",
            "ControllerExpandVolumeResponse",
        ))
        .method(unary(
            "controller_get_volume",
            "ControllerGetVolume",
            "ControllerGetVolumeRequest",
            "ControllerGetVolumeResponse",
        ))
        .method(unary(
            "controller_modify_volume",
            "ControllerModifyVolume",
            "ControllerModifyVolumeRequest",
            "ControllerModifyVolumeResponse",
        ))
        .build()
}

fn node() -> Service {
    Service::builder()
        .name("Node")
        .package(PACKAGE)
        .method(unary(
            "node_stage_volume",
            "NodeStageVolume",
            "NodeStageVolumeRequest",
            "NodeStageVolumeResponse",
        ))
        .method(unary(
            "node_unstage_volume",
            "NodeUnstageVolume",
            "NodeUnstageVolumeRequest",
            "NodeUnstageVolumeResponse",
        ))
        .method(unary(
            "node_publish_volume",
            "NodePublishVolume",
            "NodePublishVolumeRequest",
            "NodePublishVolumeResponse",
        ))
        .method(unary(
            "node_unpublish_volume",
            "NodeUnpublishVolume",
            "NodeUnpublishVolumeRequest",
            "NodeUnpublishVolumeResponse",
        ))
        .method(unary(
            "node_get_volume_stats",
            "NodeGetVolumeStats",
            "NodeGetVolumeStatsRequest",
            "NodeGetVolumeStatsResponse",
        ))
        .method(unary(
            "node_expand_volume",
            "NodeExpandVolume",
            "NodeExpandVolumeRequest",
            "NodeExpandVolumeResponse",
        ))
        .method(unary(
            "node_get_capabilities",
            "NodeGetCapabilities",
            "NodeGetCapabilitiesRequest",
            "NodeGetCapabilitiesResponse",
        ))
        .method(unary(
            "node_get_info",
            "NodeGetInfo",
            "NodeGetInfoRequest",
            "NodeGetInfoResponse",
        ))
        .build()
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    Builder::new()
        .build_server(true)
        .build_client(true)
        .compile(&[identity(), controller(), node()]);
}
