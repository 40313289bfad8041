//! Tunnel targets and their canonical identity strings
//!
//! A tunnel is identified by `{namespace}/{kind}/{name}:{local}->{remote}`,
//! for example `prod/svc/postgres:5432->5432`. Two requests that produce the
//! same identity refer to the same registry slot.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

/// Kind of workload a tunnel points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pod,
    #[serde(alias = "svc")]
    Service,
}

impl ResourceKind {
    /// Short form used inside identity strings
    pub fn short_name(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "pod",
            ResourceKind::Service => "svc",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "pod",
            ResourceKind::Service => "service",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pod" | "po" | "pods" => Ok(ResourceKind::Pod),
            "service" | "svc" | "services" => Ok(ResourceKind::Service),
            other => Err(IdentityParseError(format!("unknown resource type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct IdentityParseError(String);

/// Canonical registry key for one logical tunnel slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelIdentity(String);

impl TunnelIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TunnelIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for TunnelIdentity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// What a tunnel forwards to, before any endpoint resolution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelTarget {
    pub namespace: String,
    #[serde(rename = "resourceType")]
    pub kind: ResourceKind,
    #[serde(rename = "resourceName")]
    pub name: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl TunnelTarget {
    pub fn new(
        namespace: impl Into<String>,
        kind: ResourceKind,
        name: impl Into<String>,
        local_port: u16,
        remote_port: u16,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            name: name.into(),
            local_port,
            remote_port,
        }
    }

    pub fn pod(namespace: &str, pod: &str, local_port: u16, remote_port: u16) -> Self {
        Self::new(namespace, ResourceKind::Pod, pod, local_port, remote_port)
    }

    pub fn service(namespace: &str, service: &str, local_port: u16, remote_port: u16) -> Self {
        Self::new(namespace, ResourceKind::Service, service, local_port, remote_port)
    }

    pub fn identity(&self) -> TunnelIdentity {
        TunnelIdentity(format!(
            "{}/{}/{}:{}->{}",
            self.namespace,
            self.kind.short_name(),
            self.name,
            self.local_port,
            self.remote_port
        ))
    }
}

impl FromStr for TunnelTarget {
    type Err = IdentityParseError;

    /// Parse an identity string back into its target
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IdentityParseError(format!("invalid connection id: {}", s));

        let (path, ports) = s.rsplit_once(':').ok_or_else(invalid)?;
        let (local, remote) = ports.split_once("->").ok_or_else(invalid)?;
        let local_port: u16 = local.parse().map_err(|_| invalid())?;
        let remote_port: u16 = remote.parse().map_err(|_| invalid())?;

        let mut parts = path.splitn(3, '/');
        let namespace = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let kind: ResourceKind = parts.next().ok_or_else(invalid)?.parse()?;
        let name = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;

        Ok(Self::new(namespace, kind, name, local_port, remote_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_format() {
        let target = TunnelTarget::service("prod", "postgres", 5432, 5432);
        assert_eq!(target.identity().as_str(), "prod/svc/postgres:5432->5432");

        let target = TunnelTarget::pod("default", "web-0", 8080, 80);
        assert_eq!(target.identity().as_str(), "default/pod/web-0:8080->80");
    }

    #[test]
    fn test_parse_identity() {
        let target: TunnelTarget = "prod/svc/postgres:15432->5432".parse().unwrap();
        assert_eq!(target.namespace, "prod");
        assert_eq!(target.kind, ResourceKind::Service);
        assert_eq!(target.name, "postgres");
        assert_eq!(target.local_port, 15432);
        assert_eq!(target.remote_port, 5432);
        assert_eq!(target.identity().as_str(), "prod/svc/postgres:15432->5432");
    }

    #[test]
    fn test_parse_identity_rejects_garbage() {
        assert!("prod/svc/postgres".parse::<TunnelTarget>().is_err());
        assert!("prod/deploy/api:80->80".parse::<TunnelTarget>().is_err());
        assert!("prod/pod/api:80->http".parse::<TunnelTarget>().is_err());
        assert!("/pod/api:80->80".parse::<TunnelTarget>().is_err());
    }

    #[test]
    fn test_resource_kind_serde() {
        assert_eq!(
            serde_yaml::to_string(&ResourceKind::Service).unwrap().trim(),
            "service"
        );
        let kind: ResourceKind = serde_yaml::from_str("svc").unwrap();
        assert_eq!(kind, ResourceKind::Service);
    }
}
