//! Error types for tunnel resolution, lifecycle and registry operations

use crate::identity::ResourceKind;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the resolver, tunnel workers and the manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },

    #[error("pod {pod} is not running (phase: {phase})")]
    NotRunning { pod: String, phase: String },

    #[error("service {0} has no selector")]
    NoSelector(String),

    #[error("no pods found for service {0}")]
    NoBackends(String),

    #[error("no running pods found for service {0}")]
    NoRunningBackends(String),

    #[error("port-forward already active: {0}")]
    AlreadyActive(String),

    #[error("timeout waiting for port-forward {id} after {timeout:?}")]
    Timeout { id: String, timeout: Duration },

    #[error("tunnel error: {0}")]
    Transport(String),

    #[error("cannot remove active connection {0}, stop it first")]
    CannotRemoveActive(String),

    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("port-forward {0} was cancelled before it became ready")]
    Cancelled(String),

    #[error("inventory error: {0}")]
    Inventory(String),
}

/// Errors returned by inventory backends
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InventoryError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },

    #[error("{0}")]
    Api(String),
}

impl From<InventoryError> for ForwardError {
    fn from(err: InventoryError) -> Self {
        match err {
            InventoryError::NotFound {
                kind,
                namespace,
                name,
            } => ForwardError::NotFound {
                kind,
                namespace,
                name,
            },
            InventoryError::Api(msg) => ForwardError::Inventory(msg),
        }
    }
}

pub type Result<T, E = ForwardError> = std::result::Result<T, E>;
