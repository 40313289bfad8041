//! Cluster inventory abstraction
//!
//! The manager never talks to a cluster API directly. Everything it needs to
//! know about namespaces, pods and services comes through [`Inventory`].

use crate::error::InventoryError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;

#[cfg(test)]
use mockall::automock;

/// Lifecycle phase reported for a pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn is_running(&self) -> bool {
        matches!(self, PodPhase::Running)
    }
}

impl From<&str> for PodPhase {
    fn from(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// A port declared by one of a pod's containers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPort {
    pub container: String,
    pub name: Option<String>,
    pub port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub phase: PodPhase,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<ContainerPort>,
}

impl PodInfo {
    /// True when every selector label is present with the same value
    pub fn matches(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(key, value)| self.labels.get(key) == Some(value))
    }

    /// Find a container port by its declared name
    pub fn named_port(&self, name: &str) -> Option<u16> {
        self.ports
            .iter()
            .find(|p| p.name.as_deref() == Some(name))
            .map(|p| p.port)
    }
}

/// Where a service port sends traffic on the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPort {
    Number(u16),
    Name(String),
}

impl fmt::Display for TargetPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetPort::Number(n) => write!(f, "{}", n),
            TargetPort::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePort {
    pub name: Option<String>,
    pub port: u16,
    pub target_port: Option<TargetPort>,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub namespace: String,
    pub service_type: String,
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<ServicePort>,
}

/// Read-only view of the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn list_namespaces(&self) -> Result<Vec<String>, InventoryError>;

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodInfo>, InventoryError>;

    async fn list_services(&self, namespace: &str) -> Result<Vec<ServiceInfo>, InventoryError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodInfo, InventoryError>;

    async fn get_service(&self, namespace: &str, name: &str)
        -> Result<ServiceInfo, InventoryError>;
}
