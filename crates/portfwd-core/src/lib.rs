//! Port-forward tunnel management
//!
//! This crate provides the registry of port-forward tunnels and everything
//! needed to drive them: endpoint resolution, per-tunnel workers, and session
//! persistence. Cluster access is abstracted behind [`Inventory`] and
//! [`TunnelOpener`] so the lifecycle can be exercised without a cluster.
//!
//! # Example
//!
//! ```ignore
//! use portfwd_core::{ForwardManager, SessionStore};
//! use std::sync::Arc;
//!
//! let manager = ForwardManager::new(Arc::new(inventory), Arc::new(opener));
//! let record = manager.start_to_service("prod", "postgres", 5432, 5432).await?;
//! println!("{} is {}", record.identity(), record.status());
//!
//! SessionStore::new("state.yaml").save_manager(&manager)?;
//! manager.stop_all().await;
//! ```

pub mod error;
pub mod identity;
pub mod inventory;
pub mod manager;
pub mod record;
pub mod resolver;
pub mod session;
pub mod tunnel;
mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{ForwardError, InventoryError};
pub use identity::{ResourceKind, TunnelIdentity, TunnelTarget};
pub use inventory::{Inventory, PodInfo, PodPhase, ServiceInfo, TargetPort};
pub use manager::{ForwardManager, ManagerConfig, WeakForwardManager};
pub use record::{LogHandle, TunnelRecord, TunnelSnapshot, TunnelStatus};
pub use resolver::{resolve, ResolvedEndpoint};
pub use session::{restore, PersistedSession, RestoreReport, SavedConnection, SessionStore};
pub use tunnel::{tunnel_channel, OpenedTunnel, StopSignal, TunnelOpener, TunnelSignals, TunnelSpec};
