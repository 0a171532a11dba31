//! Service capability registry and volume-capability validation.
//!
//! The registry holds the Controller and Node RPC capability sets.  It is
//! built once when the driver is constructed and only read afterwards, so it
//! is shared between the services without any synchronization.

use tracing::warn;

use crate::error::CsiError;
use crate::proto;
use crate::proto::controller_service_capability::rpc::Type as ControllerRpc;
use crate::proto::node_service_capability::rpc::Type as NodeRpc;
use crate::types::{AccessType, VolumeCapability};

/// Immutable Controller/Node capability sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRegistry {
    controller: Vec<ControllerRpc>,
    node: Vec<NodeRpc>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new(
            vec![
                ControllerRpc::CreateDeleteVolume,
                ControllerRpc::ListVolumes,
                ControllerRpc::CreateDeleteSnapshot,
                ControllerRpc::PublishUnpublishVolume,
                ControllerRpc::CloneVolume,
                ControllerRpc::ListSnapshots,
                ControllerRpc::ExpandVolume,
            ],
            vec![
                NodeRpc::StageUnstageVolume,
                NodeRpc::Unknown,
                NodeRpc::ExpandVolume,
                NodeRpc::VolumeMountGroup,
            ],
        )
    }
}

impl CapabilityRegistry {
    pub fn new(controller: Vec<ControllerRpc>, node: Vec<NodeRpc>) -> Self {
        Self { controller, node }
    }

    pub fn supports_controller(&self, rpc: ControllerRpc) -> bool {
        self.controller.contains(&rpc)
    }

    pub fn supports_node(&self, rpc: NodeRpc) -> bool {
        self.node.contains(&rpc)
    }

    /// [`CsiError::Unimplemented`] unless `rpc` is advertised.
    pub fn require_controller(&self, rpc: ControllerRpc) -> Result<(), CsiError> {
        if self.supports_controller(rpc) {
            Ok(())
        } else {
            Err(CsiError::unimplemented(format!("{rpc:?}")))
        }
    }

    /// [`CsiError::Unimplemented`] unless `rpc` is advertised.
    pub fn require_node(&self, rpc: NodeRpc) -> Result<(), CsiError> {
        if self.supports_node(rpc) {
            Ok(())
        } else {
            Err(CsiError::unimplemented(format!("{rpc:?}")))
        }
    }

    /// Controller capabilities in wire form, in registration order.
    pub fn controller_capabilities(&self) -> Vec<proto::ControllerServiceCapability> {
        use proto::controller_service_capability::{Rpc, Type};

        self.controller
            .iter()
            .map(|&rpc| proto::ControllerServiceCapability {
                r#type: Some(Type::Rpc(Rpc { r#type: rpc as i32 })),
            })
            .collect()
    }

    /// Node capabilities in wire form, in registration order.
    pub fn node_capabilities(&self) -> Vec<proto::NodeServiceCapability> {
        use proto::node_service_capability::{Rpc, Type};

        self.node
            .iter()
            .map(|&rpc| proto::NodeServiceCapability {
                r#type: Some(Type::Rpc(Rpc { r#type: rpc as i32 })),
            })
            .collect()
    }
}

/// Whether a validated capability list asks for block or file access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Block,
    Mount,
    /// No entry set an access type.
    Unspecified,
}

/// Outcome of [`validate_capabilities`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCapabilities {
    pub capabilities: Vec<VolumeCapability>,
    pub kind: CapabilityKind,
    /// Non-fatal findings, already logged at warn level.
    pub advisories: Vec<String>,
}

/// Validate the capability list of a request.
///
/// Every entry needs an access mode.  Block-typed and file-typed entries may
/// not be mixed.  Multi-node multi-writer on a block entry is accepted with
/// an advisory.
pub fn validate_capabilities(
    caps: &[proto::VolumeCapability],
) -> Result<ValidatedCapabilities, CsiError> {
    if caps.is_empty() {
        return Err(CsiError::invalid("volume capabilities not provided"));
    }

    let mut block = false;
    let mut mount = false;
    let mut advisories = Vec::new();
    let mut capabilities = Vec::with_capacity(caps.len());

    for wire in caps {
        let cap = VolumeCapability::try_from(wire)?;
        match &cap.access_type {
            Some(AccessType::Block) => {
                block = true;
                if cap.access_mode.is_multi_node_writer() {
                    let msg = "multi-node multi-writer requested on a block volume".to_owned();
                    warn!(access_mode = ?cap.access_mode, "{msg}");
                    advisories.push(msg);
                }
            }
            Some(AccessType::Mount(_)) => mount = true,
            None => {}
        }
        capabilities.push(cap);
    }

    let kind = match (block, mount) {
        (true, true) => {
            return Err(CsiError::invalid(
                "block and file volume capabilities cannot be mixed",
            ));
        }
        (true, false) => CapabilityKind::Block,
        (false, true) => CapabilityKind::Mount,
        (false, false) => CapabilityKind::Unspecified,
    };

    Ok(ValidatedCapabilities {
        capabilities,
        kind,
        advisories,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AccessMode;

    fn wire(cap: VolumeCapability) -> proto::VolumeCapability {
        proto::VolumeCapability::from(&cap)
    }

    #[test]
    fn default_sets() {
        let reg = CapabilityRegistry::default();
        assert_eq!(reg.controller_capabilities().len(), 7);
        assert_eq!(reg.node_capabilities().len(), 4);
        assert!(reg.supports_controller(ControllerRpc::CloneVolume));
        assert!(!reg.supports_controller(ControllerRpc::GetCapacity));
        assert!(reg.supports_node(NodeRpc::VolumeMountGroup));
        assert!(!reg.supports_node(NodeRpc::GetVolumeStats));
    }

    #[test]
    fn require_reports_unimplemented() {
        let reg = CapabilityRegistry::new(
            vec![ControllerRpc::CreateDeleteVolume],
            vec![NodeRpc::StageUnstageVolume],
        );
        assert!(reg.require_controller(ControllerRpc::CreateDeleteVolume).is_ok());
        assert!(matches!(
            reg.require_controller(ControllerRpc::ExpandVolume),
            Err(CsiError::Unimplemented(_))
        ));
        assert!(reg.require_node(NodeRpc::StageUnstageVolume).is_ok());
        assert!(matches!(
            reg.require_node(NodeRpc::ExpandVolume),
            Err(CsiError::Unimplemented(_))
        ));
    }

    #[test]
    fn wire_capabilities_keep_order() {
        let reg = CapabilityRegistry::default();
        let first = &reg.controller_capabilities()[0];
        assert_eq!(
            first.r#type,
            Some(proto::controller_service_capability::Type::Rpc(
                proto::controller_service_capability::Rpc {
                    r#type: ControllerRpc::CreateDeleteVolume as i32
                }
            ))
        );
    }

    #[test]
    fn rejects_empty_list() {
        assert!(matches!(
            validate_capabilities(&[]),
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_missing_access_mode() {
        let mut cap = wire(VolumeCapability::mount(AccessMode::SingleNodeWriter));
        cap.access_mode = None;
        assert!(validate_capabilities(&[cap]).is_err());
    }

    #[test]
    fn rejects_unknown_access_mode() {
        let mut cap = wire(VolumeCapability::mount(AccessMode::SingleNodeWriter));
        cap.access_mode = Some(proto::volume_capability::AccessMode { mode: 0 });
        assert!(matches!(
            validate_capabilities(&[cap]),
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_mixed_types_in_any_order() {
        let block = wire(VolumeCapability::block(AccessMode::SingleNodeWriter));
        let mount = wire(VolumeCapability::mount(AccessMode::SingleNodeWriter));
        assert!(validate_capabilities(&[block.clone(), mount.clone()]).is_err());
        assert!(validate_capabilities(&[mount, block]).is_err());
    }

    #[test]
    fn classifies_kind() {
        let v = validate_capabilities(&[
            wire(VolumeCapability::mount(AccessMode::SingleNodeWriter)),
            wire(VolumeCapability::mount(AccessMode::MultiNodeReaderOnly)),
        ])
        .expect("valid");
        assert_eq!(v.kind, CapabilityKind::Mount);
        assert_eq!(v.capabilities.len(), 2);
        assert!(v.advisories.is_empty());

        let v = validate_capabilities(&[wire(VolumeCapability {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: None,
        })])
        .expect("valid");
        assert_eq!(v.kind, CapabilityKind::Unspecified);
    }

    #[test]
    fn block_multi_writer_is_advisory() {
        let v = validate_capabilities(&[wire(VolumeCapability::block(
            AccessMode::MultiNodeMultiWriter,
        ))])
        .expect("accepted");
        assert_eq!(v.kind, CapabilityKind::Block);
        assert_eq!(v.advisories.len(), 1);
    }
}
