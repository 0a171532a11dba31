//! Host mounter based on directories and bind mounts.
//!
//! Staging prepares a directory at the staging path; publishing bind-mounts
//! that directory onto the target path.  Idempotency is derived from the
//! host's mount table, so retries after a plugin restart converge.
//!
//! Targets published through this process are also tracked per volume;
//! unstaging is refused while any of them is still mounted.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use nix::mount::MsFlags;
use tracing::{debug, info, instrument, warn};

use super::Mounter;
use crate::error::CsiError;
use crate::types::*;

/// Return `true` if `path` is currently listed as a mount point in
/// `/proc/self/mounts`.
///
/// Note: `/proc/self/mounts` uses octal escapes (`\040` for space, etc.).
/// CSI target paths must not contain whitespace, so direct string comparison
/// is safe here.
pub async fn is_mountpoint(path: &Path) -> bool {
    let contents = match tokio::fs::read_to_string("/proc/self/mounts").await {
        Ok(c) => c,
        Err(_) => return false,
    };
    let Some(path) = path.to_str() else {
        return false;
    };
    // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
    contents
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(path))
}

/// `true` when the capability or the request asks for a read-only target.
fn wants_read_only(req: &PublishRequest) -> bool {
    req.read_only
        || req.capability.access_mode.is_read_only()
        || req.capability.mount_flags().iter().any(|f| f == "ro")
}

fn mount_failed(path: &Path, reason: impl ToString) -> CsiError {
    CsiError::MountFailed {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

fn unmount_failed(path: &Path, reason: impl ToString) -> CsiError {
    CsiError::UnmountFailed {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Remove a directory this mounter created, keeping it when it has content.
async fn remove_created_dir(path: &Path) -> Result<(), CsiError> {
    match tokio::fs::remove_dir(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
            // Content belongs to the volume; leave it in place.
            warn!(path = %path.display(), "directory not empty, keeping it");
            Ok(())
        }
        Err(e) => Err(unmount_failed(path, format!("remove dir: {e}"))),
    }
}

/// Directory + bind-mount mounter.  Requires `CAP_SYS_ADMIN` to publish.
#[derive(Debug, Clone, Default)]
pub struct BindMounter {
    /// Mode applied to directories this mounter creates; 0 leaves the
    /// process umask in effect.
    mount_permissions: u32,
    /// Volume -> target paths published by this process.
    published: Arc<DashMap<VolumeId, HashSet<PathBuf>>>,
}

impl BindMounter {
    pub fn new(mount_permissions: u32) -> Self {
        Self {
            mount_permissions,
            ..Self::default()
        }
    }

    /// Targets of `volume_id` that are still mounted.  Targets unmounted
    /// behind our back are forgotten.
    async fn mounted_targets(&self, volume_id: &VolumeId) -> Vec<PathBuf> {
        let targets: Vec<PathBuf> = match self.published.get(volume_id) {
            Some(set) => set.iter().cloned().collect(),
            None => return Vec::new(),
        };
        let mut mounted = Vec::new();
        for target in targets {
            if is_mountpoint(&target).await {
                mounted.push(target);
            } else {
                self.forget(volume_id, &target);
            }
        }
        mounted
    }

    fn forget(&self, volume_id: &VolumeId, target_path: &Path) {
        if let dashmap::mapref::entry::Entry::Occupied(mut e) =
            self.published.entry(volume_id.clone())
        {
            e.get_mut().remove(target_path);
            if e.get().is_empty() {
                e.remove();
            }
        }
    }

    async fn create_dir(&self, path: &Path) -> Result<(), CsiError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| mount_failed(path, e))?;
        if self.mount_permissions != 0 {
            let perms = std::fs::Permissions::from_mode(self.mount_permissions);
            tokio::fs::set_permissions(path, perms)
                .await
                .map_err(|e| mount_failed(path, format!("chmod {:o}: {e}", self.mount_permissions)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Mounter for BindMounter {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn stage(&self, req: StageRequest) -> Result<(), CsiError> {
        if req.capability.is_block() {
            return Err(CsiError::invalid("block volumes cannot be staged by the bind mounter"));
        }
        let staging = req.staging_target_path.as_path();
        if tokio::fs::metadata(staging).await.is_ok_and(|m| m.is_dir()) {
            debug!(path = %staging.display(), "staging path already exists, assuming idempotent retry");
            return Ok(());
        }
        self.create_dir(staging).await?;
        info!(path = %staging.display(), "volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &Path,
    ) -> Result<(), CsiError> {
        if tokio::fs::metadata(staging_target_path).await.is_err() {
            debug!("staging path gone, nothing to unstage");
            return Ok(());
        }

        let mounted = self.mounted_targets(volume_id).await;
        if let Some(target) = mounted.first() {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {volume_id} is still published at {}",
                target.display()
            )));
        }

        if is_mountpoint(staging_target_path).await {
            nix::mount::umount(staging_target_path)
                .map_err(|e| unmount_failed(staging_target_path, e))?;
        }

        remove_created_dir(staging_target_path).await?;

        info!(path = %staging_target_path.display(), "volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn publish(&self, req: PublishRequest) -> Result<(), CsiError> {
        if req.capability.is_block() {
            return Err(CsiError::invalid("block volumes cannot be published by the bind mounter"));
        }
        if !tokio::fs::metadata(&req.staging_target_path)
            .await
            .is_ok_and(|m| m.is_dir())
        {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {} is not staged at {}",
                req.volume_id,
                req.staging_target_path.display()
            )));
        }

        // Without this check a second call would stack another bind mount.
        if is_mountpoint(&req.target_path).await {
            debug!(target_path = %req.target_path.display(), "target already mounted, assuming idempotent retry");
            self.published
                .entry(req.volume_id.clone())
                .or_default()
                .insert(req.target_path.clone());
            return Ok(());
        }

        self.create_dir(&req.target_path).await?;

        let read_only = wants_read_only(&req);
        let mut flags = MsFlags::MS_BIND;
        if read_only {
            flags |= MsFlags::MS_RDONLY;
        }

        nix::mount::mount(
            Some(req.staging_target_path.as_path()),
            req.target_path.as_path(),
            None::<&str>,
            flags,
            None::<&str>,
        )
        .map_err(|e| mount_failed(&req.target_path, e))?;

        // MS_RDONLY is ignored on the initial bind; a remount enforces it.
        if read_only {
            nix::mount::mount(
                None::<&str>,
                req.target_path.as_path(),
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| mount_failed(&req.target_path, format!("remount read-only: {e}")))?;
        }

        self.published
            .entry(req.volume_id.clone())
            .or_default()
            .insert(req.target_path.clone());
        info!(
            target_path = %req.target_path.display(),
            read_only,
            "volume published (bind-mount)",
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish(&self, volume_id: &VolumeId, target_path: &Path) -> Result<(), CsiError> {
        if is_mountpoint(target_path).await {
            nix::mount::umount(target_path).map_err(|e| unmount_failed(target_path, e))?;
            info!(target_path = %target_path.display(), "volume unpublished");
        } else {
            debug!("target not mounted, nothing to unmount");
        }
        self.forget(volume_id, target_path);
        remove_created_dir(target_path).await
    }

    #[instrument(skip(self))]
    async fn expand(
        &self,
        volume_id: &VolumeId,
        volume_path: &Path,
        range: Option<CapacityRange>,
    ) -> Result<i64, CsiError> {
        if tokio::fs::metadata(volume_path).await.is_err() {
            return Err(CsiError::NotFound(format!(
                "volume path {} does not exist",
                volume_path.display()
            )));
        }
        // A bind mount has no filesystem of its own to grow.
        Ok(range.map_or(0, |r| r.required_bytes))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn stage_req(path: &Path) -> StageRequest {
        StageRequest {
            volume_id: "vol".into(),
            staging_target_path: path.to_path_buf(),
            capability: VolumeCapability::mount(AccessMode::SingleNodeWriter),
            volume_context: HashMap::new(),
            publish_context: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn stage_and_unstage_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = tmp.path().join("globalmount");
        let m = BindMounter::new(0o750);

        m.stage(stage_req(&staging)).await.unwrap();
        let meta = std::fs::metadata(&staging).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o777, 0o750);
        m.stage(stage_req(&staging)).await.unwrap();

        m.unstage(&"vol".into(), &staging).await.unwrap();
        assert!(!staging.exists());
        m.unstage(&"vol".into(), &staging).await.unwrap();
    }

    #[tokio::test]
    async fn unstage_keeps_non_empty_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = tmp.path().join("globalmount");
        let m = BindMounter::default();
        m.stage(stage_req(&staging)).await.unwrap();
        std::fs::write(staging.join("data"), b"x").unwrap();

        m.unstage(&"vol".into(), &staging).await.unwrap();
        assert!(staging.join("data").exists());
    }

    #[tokio::test]
    async fn block_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut req = stage_req(tmp.path());
        req.capability = VolumeCapability::block(AccessMode::SingleNodeWriter);
        assert!(matches!(
            BindMounter::default().stage(req).await,
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn publish_requires_staging_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let req = PublishRequest {
            volume_id: "vol".into(),
            staging_target_path: tmp.path().join("missing"),
            target_path: tmp.path().join("target"),
            capability: VolumeCapability::mount(AccessMode::SingleNodeWriter),
            read_only: false,
            volume_context: HashMap::new(),
        };
        assert!(matches!(
            BindMounter::default().publish(req).await,
            Err(CsiError::FailedPrecondition(_))
        ));
    }

    #[tokio::test]
    async fn unpublish_removes_target_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("pods").join("volume");
        std::fs::create_dir_all(&target).unwrap();
        let m = BindMounter::default();

        m.unpublish(&"vol".into(), &target).await.unwrap();
        assert!(!target.exists());
        assert!(tmp.path().join("pods").exists());
        // idempotent
        m.unpublish(&"vol".into(), &target).await.unwrap();
    }

    #[tokio::test]
    async fn unstage_refused_while_target_mounted() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = tmp.path().join("globalmount");
        let m = BindMounter::default();
        m.stage(stage_req(&staging)).await.unwrap();

        // /proc is always a mount point; record it as a published target.
        m.published
            .entry("vol".into())
            .or_default()
            .insert(PathBuf::from("/proc"));
        assert!(matches!(
            m.unstage(&"vol".into(), &staging).await,
            Err(CsiError::FailedPrecondition(_))
        ));
        assert!(staging.exists());

        // a recorded target that is no longer mounted does not block
        m.published.insert(
            "vol".into(),
            HashSet::from([tmp.path().join("gone")]),
        );
        m.unstage(&"vol".into(), &staging).await.unwrap();
        assert!(!staging.exists());
        assert!(m.published.get(&VolumeId::from("vol")).is_none());
    }

    #[test]
    fn read_only_sources() {
        let mut req = PublishRequest {
            volume_id: "vol".into(),
            staging_target_path: "/s".into(),
            target_path: "/t".into(),
            capability: VolumeCapability::mount(AccessMode::SingleNodeWriter),
            read_only: false,
            volume_context: HashMap::new(),
        };
        assert!(!wants_read_only(&req));
        req.capability.access_type = Some(AccessType::Mount(MountOptions {
            mount_flags: vec!["ro".into()],
            ..Default::default()
        }));
        assert!(wants_read_only(&req));
        req.capability = VolumeCapability::mount(AccessMode::MultiNodeReaderOnly);
        assert!(wants_read_only(&req));
    }
}
