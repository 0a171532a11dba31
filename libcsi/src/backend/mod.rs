//! Storage collaborators the services delegate to.
//!
//! The Controller service talks to a [`Provisioner`], the Node service to a
//! [`Mounter`] and a [`HostIdentity`].  Cross-request exclusion on the same
//! volume is the collaborator's job; the services only validate requests.
//!
//! Reference implementations:
//!
//! | Type | Trait | Notes |
//! |---|---|---|
//! | [`MemoryProvisioner`] | [`Provisioner`] | `DashMap` state, optional JSON sidecars |
//! | [`MemoryMounter`] | [`Mounter`] | state machine only, no syscalls |
//! | [`BindMounter`] | [`Mounter`] | directories + bind mounts via `nix` |
//! | [`SystemHostIdentity`] | [`HostIdentity`] | `hostname -f` with a timeout |

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::*;

pub mod bind;
pub mod host;
pub mod memory;

pub use bind::BindMounter;
pub use host::SystemHostIdentity;
pub use memory::{MemoryMounter, MemoryProvisioner};

/// Cluster-side volume allocation.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create a volume, or return the existing one for an identical request.
    async fn create(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a volume.  Deleting an unknown volume succeeds.
    async fn delete(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Look up a single volume.
    async fn get(&self, volume_id: &VolumeId) -> Result<Option<Volume>, CsiError>;

    /// Make a volume available to a node; returns the publish context.
    async fn attach(
        &self,
        volume_id: &VolumeId,
        node_id: &NodeId,
        read_only: bool,
    ) -> Result<HashMap<String, String>, CsiError>;

    /// Reverse of [`Provisioner::attach`]; `None` detaches from every node.
    async fn detach(&self, volume_id: &VolumeId, node_id: Option<&NodeId>) -> Result<(), CsiError>;

    /// Grow a volume to at least `required_bytes`; returns the new capacity.
    async fn expand(&self, volume_id: &VolumeId, range: CapacityRange) -> Result<i64, CsiError>;

    /// List volumes in a stable order.
    async fn list(&self, page: &PageRequest) -> Result<Page<VolumeEntry>, CsiError>;

    async fn create_snapshot(
        &self,
        _source_volume_id: &VolumeId,
        _name: &str,
        _parameters: &HashMap<String, String>,
    ) -> Result<Snapshot, CsiError> {
        Err(CsiError::unimplemented("CreateSnapshot"))
    }

    async fn delete_snapshot(&self, _snapshot_id: &str) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("DeleteSnapshot"))
    }

    async fn list_snapshots(
        &self,
        _filter: &SnapshotFilter,
        _page: &PageRequest,
    ) -> Result<Page<Snapshot>, CsiError> {
        Ok(Page {
            entries: Vec::new(),
            next_token: None,
        })
    }
}

/// Node-side mount handling.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Prepare a volume at its staging path.
    async fn stage(&self, req: StageRequest) -> Result<(), CsiError>;

    /// Reverse of [`Mounter::stage`]; succeeds when nothing is staged.
    async fn unstage(&self, volume_id: &VolumeId, staging_target_path: &Path)
    -> Result<(), CsiError>;

    /// Expose a staged volume at a target path.
    async fn publish(&self, req: PublishRequest) -> Result<(), CsiError>;

    /// Reverse of [`Mounter::publish`]; succeeds when nothing is published.
    async fn unpublish(&self, volume_id: &VolumeId, target_path: &Path) -> Result<(), CsiError>;

    /// Grow the filesystem of a staged volume; returns the new capacity.
    async fn expand(
        &self,
        volume_id: &VolumeId,
        volume_path: &Path,
        range: Option<CapacityRange>,
    ) -> Result<i64, CsiError>;
}

/// Source of the host name that goes into the node identifier.
#[async_trait]
pub trait HostIdentity: Send + Sync {
    /// Fully-qualified domain name of this host.
    async fn fqdn(&self) -> Result<String, CsiError>;

    /// Secondary, unqualified host name.
    async fn hostname(&self) -> Result<String, CsiError>;
}

/// The collaborators a running driver is composed with.
#[derive(Clone)]
pub struct Backends {
    pub provisioner: Arc<dyn Provisioner>,
    pub mounter: Arc<dyn Mounter>,
    pub host: Arc<dyn HostIdentity>,
}

impl Backends {
    /// In-memory provisioner and mounter with the system host identity.
    pub fn in_memory() -> Self {
        Self {
            provisioner: Arc::new(MemoryProvisioner::new()),
            mounter: Arc::new(MemoryMounter::new()),
            host: Arc::new(SystemHostIdentity::default()),
        }
    }
}
