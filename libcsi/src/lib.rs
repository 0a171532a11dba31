//! # libcsi: CSI v1 plugin core for RK8s
//!
//! `libcsi` implements the three gRPC services of the [Container Storage
//! Interface][csi] (Identity, Controller and Node) on top of `tonic`, with
//! storage work delegated to pluggable backends.  It follows the RK8s
//! architecture conventions (Tokio async runtime, `tracing` for
//! observability, `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`proto`] | `csi.v1` wire messages and generated service stubs. |
//! | [`types`] | Domain model: `Volume`, `NodeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum and its mapping onto gRPC status codes. |
//! | [`capability`] | Advertised RPC capabilities and capability validation. |
//! | [`driver`] | [`Driver`]: validated configuration, service wiring. |
//! | [`identity`] | [`IdentityService`]: plugin info, capabilities, probe. |
//! | [`controller`] | [`ControllerService`]: volume and snapshot lifecycle. |
//! | [`node`] | [`NodeService`]: stage, publish, expand, node info. |
//! | [`transport`] | Unix/TCP endpoints, non-blocking server, client. |
//! | [`backend`] | Provisioner, mounter and host identity implementations. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod capability;
pub mod controller;
pub mod driver;
pub mod error;
pub mod identity;
pub mod node;
pub mod proto;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use controller::ControllerService;
pub use driver::{Driver, DriverOptions};
pub use error::CsiError;
pub use identity::IdentityService;
pub use node::NodeService;
pub use types::*;
