//! Command-line and environment configuration for the CSI plugin.
//!
//! Environment variables:
//! - `NODE_IP`: node id reported in `NodeGetInfo` (after the host name).
//! - `CSI_DRIVER_NAME`: plugin name, e.g. `csi.rk8s.io`.
//! - `CSI_ENDPOINT`: `unix:///path/to/csi.sock` or `tcp://host:port`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use libcsi::backend::{
    Backends, BindMounter, MemoryMounter, MemoryProvisioner, Mounter, SystemHostIdentity,
};
use libcsi::driver::DEFAULT_VERSION;
use libcsi::{Driver, DriverOptions};

#[derive(Parser, Debug)]
#[command(name = "rkcsi", version, about = "CSI v1 storage plugin for RK8s")]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` takes precedence.
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the Identity, Controller and Node services.
    Serve(ServeArgs),
    /// Call GetPluginInfo and Probe on a running plugin.
    Probe {
        /// Endpoint of the plugin to probe.
        #[arg(long, env = "CSI_ENDPOINT")]
        endpoint: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum MounterKind {
    /// Bind-mount staging directories onto target paths.
    Bind,
    /// Track stage/publish state in memory only.
    Memory,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, env = "NODE_IP")]
    pub node_id: String,

    #[arg(long, env = "CSI_DRIVER_NAME")]
    pub driver_name: String,

    #[arg(long, env = "CSI_ENDPOINT")]
    pub endpoint: String,

    #[arg(long, default_value = DEFAULT_VERSION)]
    pub version: String,

    /// Directory for volume metadata sidecars; volumes are kept in memory only when unset.
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "bind")]
    pub mounter: MounterKind,

    /// Mode of directories created while staging, octal (e.g. `750`); 0 keeps the umask default.
    #[arg(long, default_value = "0", value_parser = parse_octal)]
    pub mount_permissions: u32,

    /// 0 means unlimited.
    #[arg(long, default_value_t = 0)]
    pub max_volumes_per_node: i64,

    /// Timeout of the `hostname -f` lookup.
    #[arg(long, default_value_t = 5)]
    pub hostname_timeout_secs: u64,
}

fn parse_octal(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8).map_err(|e| format!("{s:?}: {e}"))
}

impl ServeArgs {
    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            node_id: self.node_id.clone(),
            driver_name: self.driver_name.clone(),
            endpoint: self.endpoint.clone(),
            version: self.version.clone(),
            mount_permissions: self.mount_permissions,
            max_volumes_per_node: self.max_volumes_per_node,
        }
    }

    /// Build the collaborators for `driver`, recovering persisted volumes
    /// when a state directory is configured.
    pub async fn backends(&self, driver: &Driver) -> anyhow::Result<Backends> {
        let provisioner = match &self.state_dir {
            Some(dir) => {
                let provisioner = MemoryProvisioner::with_state_dir(dir);
                provisioner
                    .recover()
                    .await
                    .with_context(|| format!("recover volumes from {}", dir.display()))?;
                provisioner
            }
            None => MemoryProvisioner::new(),
        };
        let mounter: Arc<dyn Mounter> = match self.mounter {
            MounterKind::Bind => Arc::new(BindMounter::new(driver.mount_permissions())),
            MounterKind::Memory => Arc::new(MemoryMounter::new()),
        };
        Ok(Backends {
            provisioner: Arc::new(provisioner),
            mounter,
            host: Arc::new(SystemHostIdentity::new(Duration::from_secs(
                self.hostname_timeout_secs,
            ))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("rkcsi").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn serve_flags() {
        let cli = parse(&[
            "serve",
            "--node-id",
            "10.0.0.7",
            "--driver-name",
            "csi.rk8s.io",
            "--endpoint",
            "unix:///csi/csi.sock",
            "--mounter",
            "memory",
            "--mount-permissions",
            "0750",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.mounter, MounterKind::Memory);
        assert_eq!(args.mount_permissions, 0o750);
        let opts = args.driver_options();
        assert_eq!(opts.node_id, "10.0.0.7");
        assert_eq!(opts.version, DEFAULT_VERSION);
        assert_eq!(opts.max_volumes_per_node, 0);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn octal_permissions() {
        assert_eq!(parse_octal("750"), Ok(0o750));
        assert_eq!(parse_octal("0o700"), Ok(0o700));
        assert!(parse_octal("9").is_err());
    }

    #[tokio::test]
    async fn backends_recover_from_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cli = parse(&[
            "serve",
            "--node-id",
            "n",
            "--driver-name",
            "d",
            "--endpoint",
            "tcp://127.0.0.1:0",
            "--state-dir",
            dir.path().to_str().unwrap(),
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let driver = Driver::new(args.driver_options()).unwrap();
        args.backends(&driver).await.unwrap();
    }
}
