//! In-memory provisioner and mounter.
//!
//! [`MemoryProvisioner`] keeps volumes and snapshots in concurrent maps and,
//! when given a state directory, mirrors every volume into a JSON sidecar so
//! that idempotent `CreateVolume` keeps working across plugin restarts.
//! [`MemoryMounter`] implements the node-side stage/publish state machine
//! without touching the host.
//!
//! # On-disk layout
//!
//! ```text
//! <state_dir>/
//!   <volume-id>.meta.json   # VolumeRecord, rebuilt by `recover()`
//! ```
//!
//! The file stem is the percent-encoded volume id, so ids containing `/` or
//! `..` stay inside the state directory.  Sidecars are written to a `.tmp`
//! file first and renamed into place.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{Mounter, Provisioner};
use crate::error::CsiError;
use crate::types::*;

/// Capacity given to volumes created without a size hint (1 GiB).
pub const DEFAULT_CAPACITY_BYTES: i64 = 1 << 30;

const META_SUFFIX: &str = ".meta.json";
const TMP_SUFFIX: &str = ".tmp";

/// Publish-context key carrying the node a volume was attached to.
pub const PUBLISH_CONTEXT_NODE: &str = "attachedNode";
/// Publish-context key carrying the read-only flag of an attachment.
pub const PUBLISH_CONTEXT_READONLY: &str = "readOnly";

/// Persisted state of one volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VolumeRecord {
    volume: Volume,
    /// Node id -> read-only flag of the attachment.
    #[serde(default)]
    published_nodes: BTreeMap<String, bool>,
}

/// Volume provisioner backed by [`DashMap`]s.
///
/// # Thread safety
///
/// Decisions on a single volume are taken under the map's entry lock, so
/// concurrent calls on the same name resolve to one winner.  Sidecar writes
/// are serialized and always write the latest in-memory state.
pub struct MemoryProvisioner {
    volumes: DashMap<VolumeId, VolumeRecord>,
    snapshots: DashMap<String, Snapshot>,
    state_dir: Option<PathBuf>,
    persist_lock: Mutex<()>,
}

impl Default for MemoryProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvisioner {
    /// A provisioner that keeps everything in memory.
    pub fn new() -> Self {
        Self {
            volumes: DashMap::new(),
            snapshots: DashMap::new(),
            state_dir: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// A provisioner that mirrors volumes into `state_dir`.
    ///
    /// Call [`Self::recover`] afterwards to restore state from a previous
    /// process run.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: Some(state_dir.into()),
            ..Self::new()
        }
    }

    /// Number of volumes currently known.
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    fn meta_path(dir: &Path, volume_id: &VolumeId) -> PathBuf {
        dir.join(format!("{}{META_SUFFIX}", urlencoding::encode(&volume_id.0)))
    }

    /// Size picked for a new volume.
    fn initial_capacity(range: Option<CapacityRange>) -> i64 {
        match range {
            Some(r) if r.required_bytes > 0 => r.required_bytes,
            Some(r) if r.limit_bytes > 0 => r.limit_bytes.min(DEFAULT_CAPACITY_BYTES),
            _ => DEFAULT_CAPACITY_BYTES,
        }
    }

    /// Write the current state of `volume_id` to its sidecar, or remove the
    /// sidecar when the volume no longer exists.
    async fn persist(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;

        let path = Self::meta_path(dir, volume_id);
        let record = self.volumes.get(volume_id).map(|r| r.clone());
        match record {
            Some(record) => {
                tokio::fs::create_dir_all(dir).await.map_err(|e| {
                    CsiError::BackendError(format!("create dir {}: {e}", dir.display()))
                })?;
                let json = serde_json::to_string_pretty(&record).map_err(CsiError::backend)?;
                let mut tmp = path.clone().into_os_string();
                tmp.push(TMP_SUFFIX);
                let tmp = PathBuf::from(tmp);
                if let Err(e) = tokio::fs::write(&tmp, json).await {
                    return Err(CsiError::BackendError(format!("write meta {volume_id}: {e}")));
                }
                if let Err(e) = tokio::fs::rename(&tmp, &path).await {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(CsiError::BackendError(format!(
                        "rename meta {volume_id}: {e}"
                    )));
                }
                Ok(())
            }
            None => match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(CsiError::BackendError(format!(
                    "remove meta {}: {e}",
                    path.display()
                ))),
            },
        }
    }

    /// Scan the state directory for sidecars and rebuild the volume map.
    ///
    /// Best effort: unreadable or unparsable sidecars are skipped with a
    /// warning.  A missing state directory means there is nothing to recover.
    pub async fn recover(&self) -> Result<usize, CsiError> {
        let Some(state_dir) = &self.state_dir else {
            return Ok(0);
        };
        let mut dir = match tokio::fs::read_dir(state_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(CsiError::BackendError(format!(
                    "read_dir {}: {e}",
                    state_dir.display()
                )));
            }
        };

        let mut restored = 0;
        while let Some(entry) = dir.next_entry().await.map_err(CsiError::backend)? {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !file_name.ends_with(META_SUFFIX) {
                continue;
            }

            let json = match tokio::fs::read_to_string(&path).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read volume metadata, skipping");
                    continue;
                }
            };
            let record: VolumeRecord = match serde_json::from_str(&json) {
                Ok(r) => r,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse volume metadata, skipping");
                    continue;
                }
            };

            self.volumes.insert(record.volume.volume_id.clone(), record);
            restored += 1;
        }

        info!(state_dir = %state_dir.display(), count = restored, "recovery complete");
        Ok(restored)
    }
}

#[async_trait]
impl Provisioner for MemoryProvisioner {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        match &req.content_source {
            Some(ContentSource::Snapshot(id)) if !self.snapshots.contains_key(id) => {
                return Err(CsiError::NotFound(format!("source snapshot {id}")));
            }
            Some(ContentSource::Volume(id)) if !self.volumes.contains_key(id) => {
                return Err(CsiError::NotFound(format!("source volume {id}")));
            }
            _ => {}
        }

        let volume_id = VolumeId(req.name.clone());
        let volume = match self.volumes.entry(volume_id.clone()) {
            Entry::Occupied(e) => {
                let existing = &e.get().volume;
                let compatible = existing.parameters == req.parameters
                    && existing.content_source == req.content_source
                    && req
                        .capacity_range
                        .is_none_or(|r| r.admits(existing.capacity_bytes));
                if !compatible {
                    return Err(CsiError::AlreadyExists(format!(
                        "volume {volume_id} exists with different parameters"
                    )));
                }
                debug!(%volume_id, "returning existing volume for idempotent create");
                return Ok(existing.clone());
            }
            Entry::Vacant(v) => {
                let volume = Volume {
                    volume_id: volume_id.clone(),
                    capacity_bytes: Self::initial_capacity(req.capacity_range),
                    volume_context: req.parameters.clone(),
                    parameters: req.parameters,
                    content_source: req.content_source,
                    accessible_topology: req.accessibility.into_iter().take(1).collect(),
                };
                v.insert(VolumeRecord {
                    volume: volume.clone(),
                    published_nodes: BTreeMap::new(),
                });
                volume
            }
        };

        if let Err(e) = self.persist(&volume_id).await {
            self.volumes.remove(&volume_id);
            return Err(e);
        }

        info!(%volume_id, capacity_bytes = volume.capacity_bytes, "volume created");
        Ok(volume)
    }

    #[instrument(skip(self))]
    async fn delete(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let removed = match self.volumes.entry(volume_id.clone()) {
            Entry::Vacant(_) => {
                debug!(%volume_id, "volume absent, nothing to delete");
                return Ok(());
            }
            Entry::Occupied(e) => {
                if !e.get().published_nodes.is_empty() {
                    return Err(CsiError::FailedPrecondition(format!(
                        "volume {volume_id} is still published"
                    )));
                }
                e.remove()
            }
        };

        if let Err(e) = self.persist(volume_id).await {
            self.volumes.insert(volume_id.clone(), removed);
            return Err(e);
        }

        info!(%volume_id, "volume deleted");
        Ok(())
    }

    async fn get(&self, volume_id: &VolumeId) -> Result<Option<Volume>, CsiError> {
        Ok(self.volumes.get(volume_id).map(|r| r.volume.clone()))
    }

    #[instrument(skip(self), fields(node_id = %node_id))]
    async fn attach(
        &self,
        volume_id: &VolumeId,
        node_id: &NodeId,
        read_only: bool,
    ) -> Result<HashMap<String, String>, CsiError> {
        let node = node_id.to_string();
        let changed = {
            let mut record = self
                .volumes
                .get_mut(volume_id)
                .ok_or_else(|| CsiError::VolumeNotFound(volume_id.to_string()))?;
            match record.published_nodes.get(&node) {
                Some(&ro) if ro == read_only => false,
                Some(_) => {
                    return Err(CsiError::AlreadyExists(format!(
                        "volume {volume_id} is published to {node} with a different read-only flag"
                    )));
                }
                None => {
                    record.published_nodes.insert(node.clone(), read_only);
                    true
                }
            }
        };

        if changed {
            if let Err(e) = self.persist(volume_id).await {
                if let Some(mut record) = self.volumes.get_mut(volume_id) {
                    record.published_nodes.remove(&node);
                }
                return Err(e);
            }
            info!(%volume_id, "volume attached");
        }

        Ok(HashMap::from([
            (PUBLISH_CONTEXT_NODE.to_owned(), node),
            (PUBLISH_CONTEXT_READONLY.to_owned(), read_only.to_string()),
        ]))
    }

    #[instrument(skip(self))]
    async fn detach(&self, volume_id: &VolumeId, node_id: Option<&NodeId>) -> Result<(), CsiError> {
        let removed: BTreeMap<String, bool> = match self.volumes.get_mut(volume_id) {
            None => BTreeMap::new(),
            Some(mut record) => match node_id {
                Some(node) => {
                    let node = node.to_string();
                    record
                        .published_nodes
                        .remove(&node)
                        .map(|ro| BTreeMap::from([(node, ro)]))
                        .unwrap_or_default()
                }
                None => std::mem::take(&mut record.published_nodes),
            },
        };

        if !removed.is_empty() {
            if let Err(e) = self.persist(volume_id).await {
                if let Some(mut record) = self.volumes.get_mut(volume_id) {
                    record.published_nodes.extend(removed);
                }
                return Err(e);
            }
            info!(%volume_id, "volume detached");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn expand(&self, volume_id: &VolumeId, range: CapacityRange) -> Result<i64, CsiError> {
        let (capacity, previous) = {
            let mut record = self
                .volumes
                .get_mut(volume_id)
                .ok_or_else(|| CsiError::VolumeNotFound(volume_id.to_string()))?;
            let current = record.volume.capacity_bytes;
            if range.limit_bytes > 0 && current > range.limit_bytes {
                return Err(CsiError::invalid(format!(
                    "volume {volume_id} is already {current} bytes, above limit {}",
                    range.limit_bytes
                )));
            }
            if range.required_bytes > current {
                record.volume.capacity_bytes = range.required_bytes;
                (range.required_bytes, Some(current))
            } else {
                (current, None)
            }
        };

        if let Some(previous) = previous {
            if let Err(e) = self.persist(volume_id).await {
                if let Some(mut record) = self.volumes.get_mut(volume_id)
                    && record.volume.capacity_bytes == capacity
                {
                    record.volume.capacity_bytes = previous;
                }
                return Err(e);
            }
            info!(%volume_id, capacity_bytes = capacity, "volume expanded");
        }
        Ok(capacity)
    }

    async fn list(&self, page: &PageRequest) -> Result<Page<VolumeEntry>, CsiError> {
        let mut entries: Vec<VolumeEntry> = self
            .volumes
            .iter()
            .map(|r| VolumeEntry {
                volume: r.volume.clone(),
                published_nodes: r.published_nodes.keys().cloned().collect(),
            })
            .collect();
        entries.sort_by(|a, b| a.volume.volume_id.cmp(&b.volume.volume_id));
        page.paginate(entries)
    }

    #[instrument(skip(self, _parameters))]
    async fn create_snapshot(
        &self,
        source_volume_id: &VolumeId,
        name: &str,
        _parameters: &HashMap<String, String>,
    ) -> Result<Snapshot, CsiError> {
        let size_bytes = self
            .volumes
            .get(source_volume_id)
            .map(|r| r.volume.capacity_bytes)
            .ok_or_else(|| CsiError::VolumeNotFound(source_volume_id.to_string()))?;

        match self.snapshots.entry(name.to_owned()) {
            Entry::Occupied(e) => {
                if e.get().source_volume_id != *source_volume_id {
                    return Err(CsiError::AlreadyExists(format!(
                        "snapshot {name} exists for volume {}",
                        e.get().source_volume_id
                    )));
                }
                debug!(snapshot_id = name, "returning existing snapshot");
                Ok(e.get().clone())
            }
            Entry::Vacant(v) => {
                let snapshot = Snapshot {
                    snapshot_id: name.to_owned(),
                    source_volume_id: source_volume_id.clone(),
                    size_bytes,
                    creation_time: SystemTime::now(),
                    ready_to_use: true,
                };
                v.insert(snapshot.clone());
                info!(snapshot_id = name, "snapshot created");
                Ok(snapshot)
            }
        }
    }

    #[instrument(skip(self))]
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CsiError> {
        if self.snapshots.remove(snapshot_id).is_some() {
            info!(snapshot_id, "snapshot deleted");
        }
        Ok(())
    }

    async fn list_snapshots(
        &self,
        filter: &SnapshotFilter,
        page: &PageRequest,
    ) -> Result<Page<Snapshot>, CsiError> {
        let mut entries: Vec<Snapshot> = self
            .snapshots
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        entries.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));
        page.paginate(entries)
    }
}

// ---------------------------------------------------------------------------
// Mounter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct PublishedTarget {
    capability: VolumeCapability,
    read_only: bool,
}

#[derive(Debug, Clone)]
struct StagedVolume {
    staging_path: PathBuf,
    capability: VolumeCapability,
    targets: HashMap<PathBuf, PublishedTarget>,
    capacity_bytes: i64,
}

/// Node-side state machine without host side effects.
///
/// Useful on hosts where the plugin must not mount anything, and as the
/// deterministic mounter in tests.
#[derive(Default)]
pub struct MemoryMounter {
    staged: DashMap<VolumeId, StagedVolume>,
}

impl MemoryMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current node-side state of a volume; `None` when unstaged.
    pub fn state(&self, volume_id: &VolumeId) -> Option<VolumeState> {
        self.staged.get(volume_id).map(|s| {
            if s.targets.is_empty() {
                VolumeState::Staged
            } else {
                VolumeState::Published
            }
        })
    }
}

#[async_trait]
impl Mounter for MemoryMounter {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn stage(&self, req: StageRequest) -> Result<(), CsiError> {
        match self.staged.entry(req.volume_id.clone()) {
            Entry::Occupied(e) => {
                let staged = e.get();
                if staged.staging_path == req.staging_target_path
                    && staged.capability == req.capability
                {
                    debug!("volume already staged with identical parameters");
                    Ok(())
                } else {
                    Err(CsiError::AlreadyExists(format!(
                        "volume {} is staged at {} with different parameters",
                        req.volume_id,
                        staged.staging_path.display()
                    )))
                }
            }
            Entry::Vacant(v) => {
                v.insert(StagedVolume {
                    staging_path: req.staging_target_path,
                    capability: req.capability,
                    targets: HashMap::new(),
                    capacity_bytes: 0,
                });
                info!("volume staged");
                Ok(())
            }
        }
    }

    #[instrument(skip(self))]
    async fn unstage(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &Path,
    ) -> Result<(), CsiError> {
        match self.staged.entry(volume_id.clone()) {
            Entry::Vacant(_) => {
                debug!("volume not staged, nothing to unstage");
                Ok(())
            }
            Entry::Occupied(e) => {
                if e.get().staging_path != staging_target_path {
                    debug!("volume staged elsewhere, nothing to unstage here");
                    return Ok(());
                }
                if !e.get().targets.is_empty() {
                    return Err(CsiError::FailedPrecondition(format!(
                        "volume {volume_id} is still published"
                    )));
                }
                e.remove();
                info!("volume unstaged");
                Ok(())
            }
        }
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn publish(&self, req: PublishRequest) -> Result<(), CsiError> {
        let mut staged = self.staged.get_mut(&req.volume_id).ok_or_else(|| {
            CsiError::FailedPrecondition(format!("volume {} is not staged", req.volume_id))
        })?;
        if staged.staging_path != req.staging_target_path {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {} is staged at {}, not {}",
                req.volume_id,
                staged.staging_path.display(),
                req.staging_target_path.display()
            )));
        }

        let target = PublishedTarget {
            capability: req.capability,
            read_only: req.read_only,
        };
        let existing = staged.targets.get(&req.target_path).cloned();
        match existing {
            Some(existing) if existing == target => {
                debug!(target_path = %req.target_path.display(), "target already published");
                Ok(())
            }
            Some(_) => Err(CsiError::AlreadyExists(format!(
                "volume {} is published at {} with different parameters",
                req.volume_id,
                req.target_path.display()
            ))),
            None => {
                info!(target_path = %req.target_path.display(), "volume published");
                staged.targets.insert(req.target_path, target);
                Ok(())
            }
        }
    }

    #[instrument(skip(self))]
    async fn unpublish(&self, volume_id: &VolumeId, target_path: &Path) -> Result<(), CsiError> {
        if let Some(mut staged) = self.staged.get_mut(volume_id)
            && staged.targets.remove(target_path).is_some()
        {
            info!("volume unpublished");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn expand(
        &self,
        volume_id: &VolumeId,
        volume_path: &Path,
        range: Option<CapacityRange>,
    ) -> Result<i64, CsiError> {
        let mut staged = self
            .staged
            .get_mut(volume_id)
            .ok_or_else(|| CsiError::VolumeNotFound(volume_id.to_string()))?;
        if staged.staging_path != volume_path && !staged.targets.contains_key(volume_path) {
            return Err(CsiError::NotFound(format!(
                "volume {volume_id} is not available at {}",
                volume_path.display()
            )));
        }
        if let Some(range) = range {
            staged.capacity_bytes = staged.capacity_bytes.max(range.required_bytes);
        }
        Ok(staged.capacity_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_req(name: &str) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.into(),
            parameters: HashMap::from([("tier".into(), "fast".into())]),
            volume_capabilities: vec![VolumeCapability::mount(AccessMode::SingleNodeWriter)],
            ..Default::default()
        }
    }

    fn node() -> NodeId {
        NodeId::new("host.example.com", "node-1").expect("node id")
    }

    #[tokio::test]
    async fn create_and_delete_volume() {
        let prov = MemoryProvisioner::new();
        let vol = prov.create(create_req("vol-a")).await.unwrap();
        assert_eq!(vol.volume_id, VolumeId::from("vol-a"));
        assert_eq!(vol.capacity_bytes, DEFAULT_CAPACITY_BYTES);
        assert_eq!(vol.volume_context.get("tier").map(String::as_str), Some("fast"));
        assert_eq!(prov.len(), 1);

        prov.delete(&vol.volume_id).await.unwrap();
        assert!(prov.is_empty());
        // idempotent
        prov.delete(&vol.volume_id).await.unwrap();
    }

    #[tokio::test]
    async fn create_volume_idempotent_by_name() {
        let prov = MemoryProvisioner::new();
        let v1 = prov.create(create_req("my-vol")).await.unwrap();
        let v2 = prov.create(create_req("my-vol")).await.unwrap();
        assert_eq!(v1, v2);
        assert_eq!(prov.len(), 1);

        let mut other = create_req("my-vol");
        other.parameters.insert("tier".into(), "slow".into());
        let err = prov.create(other).await.unwrap_err();
        assert!(matches!(err, CsiError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_sizes_from_range() {
        let prov = MemoryProvisioner::new();
        let mut req = create_req("sized");
        req.capacity_range = Some(CapacityRange::new(4096, 0).unwrap());
        assert_eq!(prov.create(req).await.unwrap().capacity_bytes, 4096);

        let mut req = create_req("capped");
        req.capacity_range = Some(CapacityRange::new(0, 1024).unwrap());
        assert_eq!(prov.create(req).await.unwrap().capacity_bytes, 1024);

        // same name, range the existing size does not satisfy
        let mut req = create_req("sized");
        req.capacity_range = Some(CapacityRange::new(8192, 0).unwrap());
        assert!(matches!(
            prov.create(req).await,
            Err(CsiError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn create_from_missing_source_is_not_found() {
        let prov = MemoryProvisioner::new();
        let mut req = create_req("clone");
        req.content_source = Some(ContentSource::Volume("nope".into()));
        assert!(matches!(prov.create(req).await, Err(CsiError::NotFound(_))));
    }

    #[tokio::test]
    async fn attach_and_detach() {
        let prov = MemoryProvisioner::new();
        let vol = prov.create(create_req("vol")).await.unwrap();

        let ctx = prov.attach(&vol.volume_id, &node(), false).await.unwrap();
        assert_eq!(
            ctx.get(PUBLISH_CONTEXT_NODE).map(String::as_str),
            Some("host.example.com$$node-1")
        );
        // idempotent for the same node and flag
        prov.attach(&vol.volume_id, &node(), false).await.unwrap();
        assert!(matches!(
            prov.attach(&vol.volume_id, &node(), true).await,
            Err(CsiError::AlreadyExists(_))
        ));

        let page = prov.list(&PageRequest::default()).await.unwrap();
        assert_eq!(page.entries[0].published_nodes, vec![node().to_string()]);

        // still published
        assert!(matches!(
            prov.delete(&vol.volume_id).await,
            Err(CsiError::FailedPrecondition(_))
        ));

        prov.detach(&vol.volume_id, None).await.unwrap();
        prov.detach(&vol.volume_id, Some(&node())).await.unwrap();
        prov.delete(&vol.volume_id).await.unwrap();
    }

    #[tokio::test]
    async fn attach_unknown_volume() {
        let prov = MemoryProvisioner::new();
        assert!(matches!(
            prov.attach(&"ghost".into(), &node(), false).await,
            Err(CsiError::VolumeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn expand_only_grows() {
        let prov = MemoryProvisioner::new();
        let vol = prov.create(create_req("vol")).await.unwrap();
        let grown = prov
            .expand(&vol.volume_id, CapacityRange::new(2 * DEFAULT_CAPACITY_BYTES, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(grown, 2 * DEFAULT_CAPACITY_BYTES);
        let same = prov
            .expand(&vol.volume_id, CapacityRange::new(1, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(same, 2 * DEFAULT_CAPACITY_BYTES);
    }

    #[tokio::test]
    async fn list_is_ordered_and_paged() {
        let prov = MemoryProvisioner::new();
        for name in ["c", "a", "b"] {
            prov.create(create_req(name)).await.unwrap();
        }
        let page = prov
            .list(&PageRequest {
                max_entries: 2,
                starting_token: None,
            })
            .await
            .unwrap();
        let ids: Vec<_> = page.entries.iter().map(|e| e.volume.volume_id.0.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(page.next_token.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn snapshot_lifecycle() {
        let prov = MemoryProvisioner::new();
        let vol = prov.create(create_req("src")).await.unwrap();
        let other = prov.create(create_req("other")).await.unwrap();

        let snap = prov
            .create_snapshot(&vol.volume_id, "snap-1", &HashMap::new())
            .await
            .unwrap();
        assert!(snap.ready_to_use);
        assert_eq!(snap.size_bytes, vol.capacity_bytes);
        let again = prov
            .create_snapshot(&vol.volume_id, "snap-1", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(snap, again);
        assert!(matches!(
            prov.create_snapshot(&other.volume_id, "snap-1", &HashMap::new())
                .await,
            Err(CsiError::AlreadyExists(_))
        ));

        let filter = SnapshotFilter {
            source_volume_id: Some(other.volume_id.clone()),
            snapshot_id: None,
        };
        let page = prov
            .list_snapshots(&filter, &PageRequest::default())
            .await
            .unwrap();
        assert!(page.entries.is_empty());

        let mut req = create_req("restored");
        req.content_source = Some(ContentSource::Snapshot("snap-1".into()));
        prov.create(req).await.unwrap();

        prov.delete_snapshot("snap-1").await.unwrap();
        prov.delete_snapshot("snap-1").await.unwrap();
    }

    #[tokio::test]
    async fn recover_restores_state() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let prov = MemoryProvisioner::with_state_dir(tmp.path());
            let vol = prov.create(create_req("persistent-vol")).await.unwrap();
            prov.attach(&vol.volume_id, &node(), false).await.unwrap();
            prov.create(create_req("gone")).await.unwrap();
            prov.delete(&"gone".into()).await.unwrap();
        }
        assert!(tmp.path().join("persistent-vol.meta.json").exists());
        assert!(!tmp.path().join("gone.meta.json").exists());
        tokio::fs::write(tmp.path().join("junk.meta.json"), "{not json")
            .await
            .unwrap();

        let prov = MemoryProvisioner::with_state_dir(tmp.path());
        assert_eq!(prov.recover().await.unwrap(), 1);

        // idempotent create still matches after restart
        let vol = prov.create(create_req("persistent-vol")).await.unwrap();
        assert_eq!(vol.volume_id, VolumeId::from("persistent-vol"));
        let page = prov.list(&PageRequest::default()).await.unwrap();
        assert_eq!(page.entries[0].published_nodes.len(), 1);
    }

    #[tokio::test]
    async fn sidecars_stay_inside_state_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let state = tmp.path().join("state");
        {
            let prov = MemoryProvisioner::with_state_dir(&state);
            prov.create(create_req("../escaped")).await.unwrap();
            prov.create(create_req("ns/pvc-1")).await.unwrap();
        }
        assert!(!tmp.path().join("escaped.meta.json").exists());
        let mut files: Vec<String> = std::fs::read_dir(&state)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        assert_eq!(files, ["..%2Fescaped.meta.json", "ns%2Fpvc-1.meta.json"]);

        let prov = MemoryProvisioner::with_state_dir(&state);
        assert_eq!(prov.recover().await.unwrap(), 2);
        assert!(prov.get(&"ns/pvc-1".into()).await.unwrap().is_some());
        prov.delete(&"../escaped".into()).await.unwrap();
        assert!(!state.join("..%2Fescaped.meta.json").exists());
    }

    #[tokio::test]
    async fn recover_ignores_partial_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let prov = MemoryProvisioner::with_state_dir(tmp.path());
        prov.create(create_req("vol-a")).await.unwrap();
        assert!(!tmp.path().join("vol-a.meta.json.tmp").exists());

        // a crash between write and rename leaves only the temp file behind
        std::fs::write(tmp.path().join("vol-b.meta.json.tmp"), "{\"volu").unwrap();
        let prov = MemoryProvisioner::with_state_dir(tmp.path());
        assert_eq!(prov.recover().await.unwrap(), 1);
    }

    /// Replace the state directory with a plain file so sidecar writes fail.
    fn break_state_dir(dir: &Path) {
        std::fs::remove_dir_all(dir).unwrap();
        std::fs::write(dir, b"").unwrap();
    }

    fn restore_state_dir(dir: &Path) {
        std::fs::remove_file(dir).unwrap();
        std::fs::create_dir(dir).unwrap();
    }

    #[tokio::test]
    async fn failed_persist_rolls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let state = tmp.path().join("state");
        let prov = MemoryProvisioner::with_state_dir(&state);
        let vol = prov.create(create_req("vol-a")).await.unwrap();
        prov.attach(&vol.volume_id, &node(), false).await.unwrap();

        break_state_dir(&state);
        let other = NodeId::new("other.example.com", "node-2").unwrap();
        assert!(matches!(
            prov.attach(&vol.volume_id, &other, false).await,
            Err(CsiError::BackendError(_))
        ));
        assert!(matches!(
            prov.detach(&vol.volume_id, None).await,
            Err(CsiError::BackendError(_))
        ));
        assert!(matches!(
            prov.expand(&vol.volume_id, CapacityRange::new(1 << 31, 0).unwrap()).await,
            Err(CsiError::BackendError(_))
        ));
        let page = prov.list(&PageRequest::default()).await.unwrap();
        assert_eq!(page.entries[0].published_nodes, vec![node().to_string()]);
        assert_eq!(page.entries[0].volume.capacity_bytes, DEFAULT_CAPACITY_BYTES);

        // the retry must reach the sidecar
        restore_state_dir(&state);
        prov.attach(&vol.volume_id, &other, false).await.unwrap();
        assert!(state.join("vol-a.meta.json").exists());

        let restarted = MemoryProvisioner::with_state_dir(&state);
        assert_eq!(restarted.recover().await.unwrap(), 1);
        assert!(matches!(
            restarted.delete(&vol.volume_id).await,
            Err(CsiError::FailedPrecondition(_))
        ));
        let page = restarted.list(&PageRequest::default()).await.unwrap();
        assert_eq!(page.entries[0].published_nodes.len(), 2);
    }

    #[tokio::test]
    async fn recover_without_state_dir() {
        let prov = MemoryProvisioner::new();
        assert_eq!(prov.recover().await.unwrap(), 0);
        let missing = MemoryProvisioner::with_state_dir("/nonexistent/path/for/test");
        assert_eq!(missing.recover().await.unwrap(), 0);
    }

    fn stage_req(id: &str, path: &str) -> StageRequest {
        StageRequest {
            volume_id: id.into(),
            staging_target_path: path.into(),
            capability: VolumeCapability::mount(AccessMode::SingleNodeWriter),
            volume_context: HashMap::new(),
            publish_context: HashMap::new(),
        }
    }

    fn publish_req(id: &str, staging: &str, target: &str) -> PublishRequest {
        PublishRequest {
            volume_id: id.into(),
            staging_target_path: staging.into(),
            target_path: target.into(),
            capability: VolumeCapability::mount(AccessMode::SingleNodeWriter),
            read_only: false,
            volume_context: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn mounter_state_machine() {
        let m = MemoryMounter::new();
        let id = VolumeId::from("vol");
        assert_eq!(m.state(&id), None);

        m.stage(stage_req("vol", "/stage/vol")).await.unwrap();
        m.stage(stage_req("vol", "/stage/vol")).await.unwrap();
        assert_eq!(m.state(&id), Some(VolumeState::Staged));
        assert!(matches!(
            m.stage(stage_req("vol", "/stage/elsewhere")).await,
            Err(CsiError::AlreadyExists(_))
        ));

        m.publish(publish_req("vol", "/stage/vol", "/pods/a")).await.unwrap();
        m.publish(publish_req("vol", "/stage/vol", "/pods/a")).await.unwrap();
        assert_eq!(m.state(&id), Some(VolumeState::Published));

        let mut ro = publish_req("vol", "/stage/vol", "/pods/a");
        ro.read_only = true;
        assert!(matches!(m.publish(ro).await, Err(CsiError::AlreadyExists(_))));

        assert!(matches!(
            m.unstage(&id, Path::new("/stage/vol")).await,
            Err(CsiError::FailedPrecondition(_))
        ));

        m.unpublish(&id, Path::new("/pods/a")).await.unwrap();
        m.unpublish(&id, Path::new("/pods/a")).await.unwrap();
        m.unstage(&id, Path::new("/stage/vol")).await.unwrap();
        m.unstage(&id, Path::new("/stage/vol")).await.unwrap();
        assert_eq!(m.state(&id), None);
    }

    #[tokio::test]
    async fn publish_requires_stage() {
        let m = MemoryMounter::new();
        assert!(matches!(
            m.publish(publish_req("vol", "/stage/vol", "/pods/a")).await,
            Err(CsiError::FailedPrecondition(_))
        ));
        m.stage(stage_req("vol", "/stage/vol")).await.unwrap();
        assert!(matches!(
            m.publish(publish_req("vol", "/stage/other", "/pods/a")).await,
            Err(CsiError::FailedPrecondition(_))
        ));
    }

    #[tokio::test]
    async fn mounter_expand() {
        let m = MemoryMounter::new();
        let id = VolumeId::from("vol");
        assert!(matches!(
            m.expand(&id, Path::new("/stage/vol"), None).await,
            Err(CsiError::VolumeNotFound(_))
        ));
        m.stage(stage_req("vol", "/stage/vol")).await.unwrap();
        let range = CapacityRange::new(2048, 0).unwrap();
        assert_eq!(
            m.expand(&id, Path::new("/stage/vol"), Some(range)).await.unwrap(),
            2048
        );
        assert!(matches!(
            m.expand(&id, Path::new("/wrong"), Some(range)).await,
            Err(CsiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_stage_on_distinct_volumes() {
        let m = std::sync::Arc::new(MemoryMounter::new());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let m = m.clone();
            tasks.push(tokio::spawn(async move {
                let id = format!("vol-{i}");
                let path = format!("/stage/{id}");
                m.stage(stage_req(&id, &path)).await?;
                m.unstage(&VolumeId(id.clone()), Path::new(&path)).await?;
                m.stage(stage_req(&id, &path)).await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        for i in 0..16 {
            assert_eq!(
                m.state(&VolumeId(format!("vol-{i}"))),
                Some(VolumeState::Staged)
            );
        }
    }
}
