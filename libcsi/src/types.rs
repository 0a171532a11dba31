//! Core CSI types: volumes, node identifiers, capabilities, requests.
//!
//! These types form the domain model shared by the services and the backend
//! collaborators.  The gRPC handlers convert the `csi.v1` wire messages in
//! [`crate::proto`] into these types once, after which everything downstream
//! works with validated values.  Persistable types are
//! [`Serialize`]/[`Deserialize`] so backends can keep JSON metadata.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;

use crate::error::{CsiError, NodeIdError};
use crate::proto;
use crate::proto::volume_capability::access_mode::Mode as ProtoMode;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
///
/// Assigned by the caller: the `name` of a `CreateVolume` request becomes the
/// identifier of the created volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Node identity
// ---------------------------------------------------------------------------

/// Separator between the host part and the configured part of a [`NodeId`].
pub const NODE_ID_SEPARATOR: &str = "$$";

/// Composite node identifier, `<fqdn>$$<node-id>` on the wire.
///
/// Produced by `NodeGetInfo` and consumed by `ControllerPublishVolume`.  A
/// value of this type always formats to a string that parses back into an
/// equal value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    fqdn: String,
    id: String,
}

impl NodeId {
    /// Build a node identifier from its two parts.
    ///
    /// Fails when either part is empty or when the combination would not
    /// split back into the same two parts.
    pub fn new(fqdn: impl Into<String>, id: impl Into<String>) -> Result<Self, NodeIdError> {
        let node = Self {
            fqdn: fqdn.into(),
            id: id.into(),
        };
        let formatted = node.to_string();
        match formatted.parse::<NodeId>() {
            Ok(parsed) if parsed == node => Ok(node),
            _ => Err(NodeIdError::Malformed(formatted)),
        }
    }

    /// Host part (fully-qualified domain name or its fallback).
    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    /// Configured node part.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(NodeIdError::Empty);
        }
        let parts: Vec<&str> = s.split(NODE_ID_SEPARATOR).collect();
        match parts.as_slice() {
            [fqdn, id] if !fqdn.is_empty() && !id.is_empty() => Ok(Self {
                fqdn: (*fqdn).to_owned(),
                id: (*id).to_owned(),
            }),
            _ => Err(NodeIdError::Malformed(s.to_owned())),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{NODE_ID_SEPARATOR}{}", self.fqdn, self.id)
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
///
/// The wire value `UNKNOWN` has no counterpart: a capability always names a
/// concrete mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Single-node read-write.
    SingleNodeWriter,
    /// Single-node read-only.
    SingleNodeReaderOnly,
    /// Multi-node read-only.
    MultiNodeReaderOnly,
    /// Multi-node, at most one writer.
    MultiNodeSingleWriter,
    /// Multi-node read-write.
    MultiNodeMultiWriter,
    /// Single-node, single-writer workload.
    SingleNodeSingleWriter,
    /// Single-node, multiple writer workloads.
    SingleNodeMultiWriter,
}

impl AccessMode {
    /// `true` for modes that allow writers on more than one node.
    pub fn is_multi_node_writer(self) -> bool {
        matches!(self, Self::MultiNodeMultiWriter)
    }

    /// `true` for modes that never allow writes.
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::SingleNodeReaderOnly | Self::MultiNodeReaderOnly)
    }
}

impl TryFrom<i32> for AccessMode {
    type Error = CsiError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        let mode = ProtoMode::try_from(value)
            .map_err(|_| CsiError::invalid(format!("unknown access mode {value}")))?;
        Ok(match mode {
            ProtoMode::Unknown => {
                return Err(CsiError::invalid("access mode must not be UNKNOWN"));
            }
            ProtoMode::SingleNodeWriter => Self::SingleNodeWriter,
            ProtoMode::SingleNodeReaderOnly => Self::SingleNodeReaderOnly,
            ProtoMode::MultiNodeReaderOnly => Self::MultiNodeReaderOnly,
            ProtoMode::MultiNodeSingleWriter => Self::MultiNodeSingleWriter,
            ProtoMode::MultiNodeMultiWriter => Self::MultiNodeMultiWriter,
            ProtoMode::SingleNodeSingleWriter => Self::SingleNodeSingleWriter,
            ProtoMode::SingleNodeMultiWriter => Self::SingleNodeMultiWriter,
        })
    }
}

impl From<AccessMode> for ProtoMode {
    fn from(mode: AccessMode) -> Self {
        match mode {
            AccessMode::SingleNodeWriter => Self::SingleNodeWriter,
            AccessMode::SingleNodeReaderOnly => Self::SingleNodeReaderOnly,
            AccessMode::MultiNodeReaderOnly => Self::MultiNodeReaderOnly,
            AccessMode::MultiNodeSingleWriter => Self::MultiNodeSingleWriter,
            AccessMode::MultiNodeMultiWriter => Self::MultiNodeMultiWriter,
            AccessMode::SingleNodeSingleWriter => Self::SingleNodeSingleWriter,
            AccessMode::SingleNodeMultiWriter => Self::SingleNodeMultiWriter,
        }
    }
}

/// Options of a mounted-filesystem capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MountOptions {
    /// Filesystem type, empty for "plugin default".
    #[serde(default)]
    pub fs_type: String,
    /// Additional mount flags (e.g. `"noatime"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
    /// Group that should own the mounted volume.
    #[serde(default)]
    pub volume_mount_group: String,
}

/// Block device or mounted filesystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AccessType {
    Block,
    Mount(MountOptions),
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Requested access type; `None` when the caller left it unset.
    pub access_type: Option<AccessType>,
}

impl VolumeCapability {
    /// A mounted-filesystem capability with default options.
    pub fn mount(access_mode: AccessMode) -> Self {
        Self {
            access_mode,
            access_type: Some(AccessType::Mount(MountOptions::default())),
        }
    }

    /// A raw block capability.
    pub fn block(access_mode: AccessMode) -> Self {
        Self {
            access_mode,
            access_type: Some(AccessType::Block),
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self.access_type, Some(AccessType::Block))
    }

    pub fn is_mount(&self) -> bool {
        matches!(self.access_type, Some(AccessType::Mount(_)))
    }

    /// Mount flags of a filesystem capability, empty otherwise.
    pub fn mount_flags(&self) -> &[String] {
        match &self.access_type {
            Some(AccessType::Mount(opts)) => &opts.mount_flags,
            _ => &[],
        }
    }
}

impl TryFrom<&proto::VolumeCapability> for VolumeCapability {
    type Error = CsiError;

    fn try_from(cap: &proto::VolumeCapability) -> Result<Self, Self::Error> {
        let mode = cap
            .access_mode
            .as_ref()
            .ok_or_else(|| CsiError::invalid("volume capability access mode not set"))?;
        let access_type = cap.access_type.as_ref().map(|t| match t {
            proto::volume_capability::AccessType::Block(_) => AccessType::Block,
            proto::volume_capability::AccessType::Mount(m) => AccessType::Mount(MountOptions {
                fs_type: m.fs_type.clone(),
                mount_flags: m.mount_flags.clone(),
                volume_mount_group: m.volume_mount_group.clone(),
            }),
        });
        Ok(Self {
            access_mode: AccessMode::try_from(mode.mode)?,
            access_type,
        })
    }
}

impl From<&VolumeCapability> for proto::VolumeCapability {
    fn from(cap: &VolumeCapability) -> Self {
        use proto::volume_capability as vc;

        let access_type = cap.access_type.as_ref().map(|t| match t {
            AccessType::Block => vc::AccessType::Block(vc::BlockVolume {}),
            AccessType::Mount(opts) => vc::AccessType::Mount(vc::MountVolume {
                fs_type: opts.fs_type.clone(),
                mount_flags: opts.mount_flags.clone(),
                volume_mount_group: opts.volume_mount_group.clone(),
            }),
        });
        Self {
            access_type,
            access_mode: Some(vc::AccessMode {
                mode: ProtoMode::from(cap.access_mode) as i32,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Capacity
// ---------------------------------------------------------------------------

/// Requested size bounds.  A zero `limit_bytes` means "no upper bound".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityRange {
    pub required_bytes: i64,
    pub limit_bytes: i64,
}

impl CapacityRange {
    /// Validate and build a range.
    pub fn new(required_bytes: i64, limit_bytes: i64) -> Result<Self, CsiError> {
        if required_bytes < 0 || limit_bytes < 0 {
            return Err(CsiError::invalid("capacity range bounds must not be negative"));
        }
        if limit_bytes > 0 && limit_bytes < required_bytes {
            return Err(CsiError::invalid(format!(
                "capacity limit {limit_bytes} is below required {required_bytes}"
            )));
        }
        Ok(Self {
            required_bytes,
            limit_bytes,
        })
    }

    /// `true` when neither bound is set.
    pub fn is_empty(&self) -> bool {
        self.required_bytes == 0 && self.limit_bytes == 0
    }

    /// `true` when `bytes` satisfies both bounds.
    pub fn admits(&self, bytes: i64) -> bool {
        bytes >= self.required_bytes && (self.limit_bytes == 0 || bytes <= self.limit_bytes)
    }
}

impl TryFrom<&proto::CapacityRange> for CapacityRange {
    type Error = CsiError;

    fn try_from(range: &proto::CapacityRange) -> Result<Self, Self::Error> {
        Self::new(range.required_bytes, range.limit_bytes)
    }
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"topology.example.com/node": "node-01"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

impl From<&Topology> for proto::Topology {
    fn from(t: &Topology) -> Self {
        Self {
            segments: t.segments.clone(),
        }
    }
}

impl From<&proto::Topology> for Topology {
    fn from(t: &proto::Topology) -> Self {
        Self {
            segments: t.segments.clone(),
        }
    }
}

/// What a new volume is pre-populated from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContentSource {
    Snapshot(String),
    Volume(VolumeId),
}

impl ContentSource {
    /// Returns `None` for a content source message with no type set.
    pub fn from_proto(src: &proto::VolumeContentSource) -> Option<Self> {
        use proto::volume_content_source::Type;

        src.r#type.as_ref().map(|t| match t {
            Type::Snapshot(s) => Self::Snapshot(s.snapshot_id.clone()),
            Type::Volume(v) => Self::Volume(VolumeId(v.volume_id.clone())),
        })
    }
}

impl From<&ContentSource> for proto::VolumeContentSource {
    fn from(src: &ContentSource) -> Self {
        use proto::volume_content_source::{SnapshotSource, Type, VolumeSource};

        let t = match src {
            ContentSource::Snapshot(id) => Type::Snapshot(SnapshotSource {
                snapshot_id: id.clone(),
            }),
            ContentSource::Volume(id) => Type::Volume(VolumeSource {
                volume_id: id.0.clone(),
            }),
        };
        Self { r#type: Some(t) }
    }
}

/// Full metadata for a provisioned volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: i64,
    /// Parameters the volume was created with.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub content_source: Option<ContentSource>,
    /// Topology constraints (e.g. node affinity).
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

impl From<&Volume> for proto::Volume {
    fn from(v: &Volume) -> Self {
        Self {
            capacity_bytes: v.capacity_bytes,
            volume_id: v.volume_id.0.clone(),
            volume_context: v.volume_context.clone(),
            content_source: v.content_source.as_ref().map(Into::into),
            accessible_topology: v.accessible_topology.iter().map(Into::into).collect(),
        }
    }
}

/// Point-in-time copy of a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    /// Identifier, equal to the name the snapshot was requested with.
    pub snapshot_id: String,
    pub source_volume_id: VolumeId,
    pub size_bytes: i64,
    pub creation_time: SystemTime,
    pub ready_to_use: bool,
}

impl From<&Snapshot> for proto::Snapshot {
    fn from(s: &Snapshot) -> Self {
        Self {
            size_bytes: s.size_bytes,
            snapshot_id: s.snapshot_id.clone(),
            source_volume_id: s.source_volume_id.0.clone(),
            creation_time: Some(prost_types::Timestamp::from(s.creation_time)),
            ready_to_use: s.ready_to_use,
            group_snapshot_id: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Volume lifecycle state
// ---------------------------------------------------------------------------

/// Tracks the lifecycle state of a volume on a particular node.
///
/// A volume with no recorded state is unstaged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeState {
    /// Volume is prepared at the staging path.
    Staged,
    /// Volume is additionally mounted at one or more target paths.
    Published,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Validated request to create a new volume.
#[derive(Debug, Clone, Default)]
pub struct CreateVolumeRequest {
    /// Caller-chosen name; becomes the volume identifier.
    pub name: String,
    /// Desired size bounds.
    pub capacity_range: Option<CapacityRange>,
    /// Required capabilities.
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Arbitrary parameters forwarded to the backend.
    pub parameters: HashMap<String, String>,
    pub content_source: Option<ContentSource>,
    /// Preferred topologies first, then requisite ones.
    pub accessibility: Vec<Topology>,
}

/// Request to stage (prepare) a volume on a node.
#[derive(Debug, Clone)]
pub struct StageRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Node-global staging directory.
    pub staging_target_path: PathBuf,
    /// Requested capability.
    pub capability: VolumeCapability,
    /// Opaque context carried from `CreateVolume`.
    pub volume_context: HashMap<String, String>,
    /// Opaque context carried from `ControllerPublishVolume`.
    pub publish_context: HashMap<String, String>,
}

/// Request to publish a staged volume at a workload target path.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The staging directory (source of the bind mount).
    pub staging_target_path: PathBuf,
    /// Target path handed to the workload.
    pub target_path: PathBuf,
    /// Requested capability.
    pub capability: VolumeCapability,
    /// Whether the target should be read-only.
    pub read_only: bool,
    pub volume_context: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Pagination window handed through from `ListVolumes` / `ListSnapshots`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// Maximum number of entries, 0 for no limit.
    pub max_entries: usize,
    /// Token returned by a previous page.
    pub starting_token: Option<String>,
}

impl PageRequest {
    /// Convert the wire fields; a negative `max_entries` is rejected.
    pub fn from_wire(max_entries: i32, starting_token: &str) -> Result<Self, CsiError> {
        let max_entries = usize::try_from(max_entries)
            .map_err(|_| CsiError::invalid("max_entries must not be negative"))?;
        Ok(Self {
            max_entries,
            starting_token: (!starting_token.is_empty()).then(|| starting_token.to_owned()),
        })
    }

    /// Cut one page out of an already ordered listing.
    ///
    /// Tokens are decimal offsets into the listing; a token that does not
    /// parse or points past the end yields [`CsiError::Aborted`].
    pub fn paginate<T>(&self, items: Vec<T>) -> Result<Page<T>, CsiError> {
        let start = match &self.starting_token {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .ok()
                .filter(|&n| n <= items.len())
                .ok_or_else(|| CsiError::Aborted(format!("invalid starting token {token:?}")))?,
        };
        let end = if self.max_entries == 0 {
            items.len()
        } else {
            items.len().min(start.saturating_add(self.max_entries))
        };
        let next_token = (end < items.len()).then(|| end.to_string());
        let entries = items.into_iter().skip(start).take(end - start).collect();
        Ok(Page {
            entries,
            next_token,
        })
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub entries: Vec<T>,
    /// Present when more entries follow.
    pub next_token: Option<String>,
}

/// A volume together with the nodes it is currently published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeEntry {
    pub volume: Volume,
    pub published_nodes: Vec<String>,
}

/// Optional filters of `ListSnapshots`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotFilter {
    pub source_volume_id: Option<VolumeId>,
    pub snapshot_id: Option<String>,
}

impl SnapshotFilter {
    pub fn matches(&self, snap: &Snapshot) -> bool {
        self.source_volume_id
            .as_ref()
            .is_none_or(|v| *v == snap.source_volume_id)
            && self
                .snapshot_id
                .as_ref()
                .is_none_or(|id| *id == snap.snapshot_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_display() {
        let id = VolumeId("vol-abc".into());
        assert_eq!(id.to_string(), "vol-abc");
    }

    #[test]
    fn node_id_parse_and_format() {
        let node: NodeId = "host.example.com$$node-1".parse().expect("parse");
        assert_eq!(node.fqdn(), "host.example.com");
        assert_eq!(node.id(), "node-1");
        assert_eq!(node.to_string(), "host.example.com$$node-1");
    }

    #[test]
    fn node_id_rejects_malformed() {
        assert_eq!("".parse::<NodeId>(), Err(NodeIdError::Empty));
        for bad in ["badid", "a$$b$$c", "$$node", "host$$", "$$"] {
            assert!(
                matches!(bad.parse::<NodeId>(), Err(NodeIdError::Malformed(_))),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn node_id_new_requires_round_trip() {
        assert!(NodeId::new("host", "node-1").is_ok());
        assert!(NodeId::new("", "node-1").is_err());
        assert!(NodeId::new("host", "").is_err());
        assert!(NodeId::new("host", "a$$b").is_err());
        // "host$" + "$$" + "n" splits as ["host", "$n"]
        assert!(NodeId::new("host$", "n").is_err());
    }

    #[test]
    fn access_mode_from_wire() {
        assert_eq!(AccessMode::try_from(1), Ok(AccessMode::SingleNodeWriter));
        assert_eq!(AccessMode::try_from(5), Ok(AccessMode::MultiNodeMultiWriter));
        assert!(AccessMode::try_from(42).is_err());
        assert!(matches!(
            AccessMode::try_from(0),
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn capability_requires_access_mode() {
        let cap = proto::VolumeCapability {
            access_type: Some(proto::volume_capability::AccessType::Block(
                proto::volume_capability::BlockVolume {},
            )),
            access_mode: None,
        };
        let err = VolumeCapability::try_from(&cap).expect_err("no access mode");
        assert!(matches!(err, CsiError::InvalidArgument(_)));
    }

    #[test]
    fn capability_wire_conversion() {
        let cap = VolumeCapability {
            access_mode: AccessMode::SingleNodeReaderOnly,
            access_type: Some(AccessType::Mount(MountOptions {
                fs_type: "ext4".into(),
                mount_flags: vec!["noatime".into()],
                volume_mount_group: String::new(),
            })),
        };
        let wire = proto::VolumeCapability::from(&cap);
        assert_eq!(VolumeCapability::try_from(&wire), Ok(cap.clone()));
        assert_eq!(cap.mount_flags(), ["noatime".to_owned()]);
        assert!(cap.access_mode.is_read_only());
    }

    #[test]
    fn capacity_range_validation() {
        assert!(CapacityRange::new(10, 0).is_ok());
        assert!(CapacityRange::new(10, 10).is_ok());
        assert!(CapacityRange::new(10, 5).is_err());
        assert!(CapacityRange::new(-1, 0).is_err());
        assert!(CapacityRange::new(0, -1).is_err());

        let range = CapacityRange::new(10, 20).expect("valid");
        assert!(range.admits(15));
        assert!(!range.admits(25));
        assert!(CapacityRange::new(10, 0).expect("valid").admits(1 << 40));
    }

    #[test]
    fn volume_serde_roundtrip() {
        let vol = Volume {
            volume_id: VolumeId("v1".into()),
            capacity_bytes: 1024 * 1024,
            parameters: HashMap::from([("key".into(), "val".into())]),
            volume_context: HashMap::new(),
            content_source: Some(ContentSource::Snapshot("snap-1".into())),
            accessible_topology: vec![Topology {
                segments: HashMap::from([("node".into(), "node-01".into())]),
            }],
        };
        let json = serde_json::to_string(&vol).expect("serialize");
        let de: Volume = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(de, vol);

        let wire = proto::Volume::from(&vol);
        assert_eq!(wire.volume_id, "v1");
        assert!(wire.content_source.is_some());
    }

    #[test]
    fn paginate_walks_the_listing() {
        let req = PageRequest {
            max_entries: 2,
            starting_token: None,
        };
        let page = req.paginate(vec![1, 2, 3, 4, 5]).expect("first page");
        assert_eq!(page.entries, vec![1, 2]);
        assert_eq!(page.next_token.as_deref(), Some("2"));

        let req = PageRequest {
            max_entries: 2,
            starting_token: Some("4".into()),
        };
        let page = req.paginate(vec![1, 2, 3, 4, 5]).expect("last page");
        assert_eq!(page.entries, vec![5]);
        assert_eq!(page.next_token, None);

        let page = PageRequest::default()
            .paginate(Vec::<u8>::new())
            .expect("empty");
        assert!(page.entries.is_empty());
    }

    #[test]
    fn paginate_rejects_bad_tokens() {
        for token in ["abc", "9"] {
            let req = PageRequest {
                max_entries: 0,
                starting_token: Some(token.into()),
            };
            assert!(matches!(
                req.paginate(vec![1, 2, 3]),
                Err(CsiError::Aborted(_))
            ));
        }
        assert!(PageRequest::from_wire(-1, "").is_err());
        assert_eq!(
            PageRequest::from_wire(3, "").expect("valid"),
            PageRequest {
                max_entries: 3,
                starting_token: None
            }
        );
    }
}
