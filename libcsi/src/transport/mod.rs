//! gRPC transport for the CSI services.
//!
//! [`NonBlockingServer`] serves Identity, Controller and Node on a single
//! [`Endpoint`]; [`CsiClient`] talks to such an endpoint.

pub mod client;
pub mod endpoint;
pub mod server;

pub use client::CsiClient;
pub use endpoint::Endpoint;
pub use server::{NonBlockingServer, ShutdownHandle};
