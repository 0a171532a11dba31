//! Host name lookup for node identifiers.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::HostIdentity;
use crate::error::CsiError;

/// Default bound on the `hostname -f` invocation.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Looks the host up via `hostname -f`, falling back to `$HOSTNAME` and the
/// kernel host name.
#[derive(Debug, Clone)]
pub struct SystemHostIdentity {
    timeout: Duration,
}

impl Default for SystemHostIdentity {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKUP_TIMEOUT)
    }
}

impl SystemHostIdentity {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HostIdentity for SystemHostIdentity {
    #[instrument(skip(self))]
    async fn fqdn(&self) -> Result<String, CsiError> {
        let mut cmd = tokio::process::Command::new("hostname");
        cmd.arg("-f").kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| CsiError::Internal(format!("hostname -f timed out after {:?}", self.timeout)))?
            .map_err(|e| CsiError::Internal(format!("hostname -f: {e}")))?;
        if !output.status.success() {
            return Err(CsiError::Internal(format!(
                "hostname -f exited with {}",
                output.status
            )));
        }

        let fqdn = String::from_utf8_lossy(&output.stdout).trim_end().to_owned();
        debug!(%fqdn, "resolved host fqdn");
        Ok(fqdn)
    }

    async fn hostname(&self) -> Result<String, CsiError> {
        if let Ok(name) = std::env::var("HOSTNAME")
            && !name.trim().is_empty()
        {
            return Ok(name);
        }
        let name = nix::unistd::gethostname().map_err(CsiError::internal)?;
        name.into_string()
            .map_err(|raw| CsiError::Internal(format!("non-UTF8 host name {raw:?}")))
    }
}
