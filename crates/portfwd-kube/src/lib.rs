//! Kubernetes backend for portfwd
//!
//! [`KubeInventory`] answers namespace, pod and service queries through the
//! API server. [`KubePortForwarder`] listens on a loopback port and carries
//! each accepted connection over a pod port-forward stream.

mod client;
mod forwarder;
mod inventory;

pub use client::{connect, KubeError};
pub use forwarder::KubePortForwarder;
pub use inventory::KubeInventory;
