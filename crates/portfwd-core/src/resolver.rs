//! Endpoint resolution: logical target to concrete pod and port
//!
//! Pods resolve to themselves. Services resolve to the first running pod
//! matching their selector, with the service port mapped through its target
//! port. Nothing here retries; callers decide what to do with a failure.

use crate::error::ForwardError;
use crate::identity::{ResourceKind, TunnelTarget};
use crate::inventory::{Inventory, PodInfo, ServiceInfo, TargetPort};

/// How the concrete port was chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSource {
    /// Pod target, declared port used as-is
    Declared,
    /// Numeric target port on the matching service port
    TargetPort,
    /// Named target port found on the backend pod
    NamedPort(String),
    /// Target port could not be resolved; the declared port is used instead
    Fallback(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub pod: String,
    pub port: u16,
    pub source: PortSource,
}

/// Resolve a target against the inventory
pub async fn resolve(
    inventory: &dyn Inventory,
    target: &TunnelTarget,
) -> Result<ResolvedEndpoint, ForwardError> {
    match target.kind {
        ResourceKind::Pod => {
            let pod = running_pod(inventory, &target.namespace, &target.name).await?;
            Ok(ResolvedEndpoint {
                pod: pod.name,
                port: target.remote_port,
                source: PortSource::Declared,
            })
        }
        ResourceKind::Service => resolve_service(inventory, target).await,
    }
}

/// Check that a target is currently reachable without resolving ports
///
/// Pods must exist and be running; services only need to exist.
pub async fn probe(inventory: &dyn Inventory, target: &TunnelTarget) -> Result<(), ForwardError> {
    match target.kind {
        ResourceKind::Pod => {
            running_pod(inventory, &target.namespace, &target.name).await?;
        }
        ResourceKind::Service => {
            inventory
                .get_service(&target.namespace, &target.name)
                .await?;
        }
    }
    Ok(())
}

async fn running_pod(
    inventory: &dyn Inventory,
    namespace: &str,
    name: &str,
) -> Result<PodInfo, ForwardError> {
    let pod = inventory.get_pod(namespace, name).await?;
    if !pod.phase.is_running() {
        return Err(ForwardError::NotRunning {
            pod: pod.name,
            phase: pod.phase.to_string(),
        });
    }
    Ok(pod)
}

async fn resolve_service(
    inventory: &dyn Inventory,
    target: &TunnelTarget,
) -> Result<ResolvedEndpoint, ForwardError> {
    let service = inventory
        .get_service(&target.namespace, &target.name)
        .await?;

    if service.selector.is_empty() {
        return Err(ForwardError::NoSelector(service.name));
    }

    let backends: Vec<PodInfo> = inventory
        .list_pods(&target.namespace)
        .await?
        .into_iter()
        .filter(|pod| pod.matches(&service.selector))
        .collect();

    if backends.is_empty() {
        return Err(ForwardError::NoBackends(service.name));
    }

    let pod = backends
        .into_iter()
        .find(|pod| pod.phase.is_running())
        .ok_or_else(|| ForwardError::NoRunningBackends(service.name.clone()))?;

    let (port, source) = target_port(&service, &pod, target.remote_port);
    Ok(ResolvedEndpoint {
        pod: pod.name,
        port,
        source,
    })
}

/// Map a declared service port to the port the backend pod listens on
fn target_port(service: &ServiceInfo, pod: &PodInfo, declared: u16) -> (u16, PortSource) {
    let Some(service_port) = service.ports.iter().find(|p| p.port == declared) else {
        return (
            declared,
            PortSource::Fallback(format!(
                "service {} does not expose port {}",
                service.name, declared
            )),
        );
    };

    match &service_port.target_port {
        Some(TargetPort::Number(n)) if *n != 0 => (*n, PortSource::TargetPort),
        Some(TargetPort::Name(name)) => match pod.named_port(name) {
            Some(port) => (port, PortSource::NamedPort(name.clone())),
            None => (
                declared,
                PortSource::Fallback(format!(
                    "named port {} not declared by pod {}",
                    name, pod.name
                )),
            ),
        },
        // An unset target port defaults to the service port itself
        _ => (declared, PortSource::TargetPort),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InventoryError;
    use crate::inventory::{ContainerPort, MockInventory, PodPhase, ServicePort};
    use std::collections::BTreeMap;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn pod(name: &str, phase: PodPhase, app: &str) -> PodInfo {
        PodInfo {
            name: name.to_string(),
            namespace: "prod".to_string(),
            phase,
            labels: labels(&[("app", app)]),
            ports: vec![ContainerPort {
                container: "main".to_string(),
                name: Some("http".to_string()),
                port: 8000,
                protocol: "TCP".to_string(),
            }],
        }
    }

    fn service(target_port: Option<TargetPort>) -> ServiceInfo {
        ServiceInfo {
            name: "api".to_string(),
            namespace: "prod".to_string(),
            service_type: "ClusterIP".to_string(),
            selector: labels(&[("app", "api")]),
            ports: vec![ServicePort {
                name: Some("web".to_string()),
                port: 80,
                target_port,
                protocol: "TCP".to_string(),
            }],
        }
    }

    fn inventory_with(svc: ServiceInfo, pods: Vec<PodInfo>) -> MockInventory {
        let mut inventory = MockInventory::new();
        inventory
            .expect_get_service()
            .returning(move |_, _| Ok(svc.clone()));
        inventory
            .expect_list_pods()
            .returning(move |_| Ok(pods.clone()));
        inventory
    }

    #[tokio::test]
    async fn test_pod_target_uses_declared_port() {
        let mut inventory = MockInventory::new();
        inventory
            .expect_get_pod()
            .withf(|ns, name| ns == "prod" && name == "api-0")
            .returning(|_, _| Ok(pod("api-0", PodPhase::Running, "api")));

        let target = TunnelTarget::pod("prod", "api-0", 9000, 9090);
        let resolved = resolve(&inventory, &target).await.unwrap();
        assert_eq!(resolved.pod, "api-0");
        assert_eq!(resolved.port, 9090);
        assert_eq!(resolved.source, PortSource::Declared);
    }

    #[tokio::test]
    async fn test_pod_not_running() {
        let mut inventory = MockInventory::new();
        inventory
            .expect_get_pod()
            .returning(|_, _| Ok(pod("api-0", PodPhase::Pending, "api")));

        let target = TunnelTarget::pod("prod", "api-0", 9000, 9000);
        let err = resolve(&inventory, &target).await.unwrap_err();
        assert_eq!(
            err,
            ForwardError::NotRunning {
                pod: "api-0".into(),
                phase: "Pending".into()
            }
        );
    }

    #[tokio::test]
    async fn test_pod_not_found() {
        let mut inventory = MockInventory::new();
        inventory.expect_get_pod().returning(|ns, name| {
            Err(InventoryError::NotFound {
                kind: ResourceKind::Pod,
                namespace: ns.to_string(),
                name: name.to_string(),
            })
        });

        let target = TunnelTarget::pod("prod", "gone", 9000, 9000);
        let err = resolve(&inventory, &target).await.unwrap_err();
        assert!(matches!(err, ForwardError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_named_target_port() {
        let inventory = inventory_with(
            service(Some(TargetPort::Name("http".into()))),
            vec![pod("api-0", PodPhase::Running, "api")],
        );

        let target = TunnelTarget::service("prod", "api", 8080, 80);
        let resolved = resolve(&inventory, &target).await.unwrap();
        assert_eq!(resolved.port, 8000);
        assert_eq!(resolved.source, PortSource::NamedPort("http".into()));
    }

    #[tokio::test]
    async fn test_numeric_target_port_skips_pod_spec() {
        let mut backend = pod("api-0", PodPhase::Running, "api");
        backend.ports.clear();
        let inventory = inventory_with(service(Some(TargetPort::Number(8000))), vec![backend]);

        let target = TunnelTarget::service("prod", "api", 8080, 80);
        let resolved = resolve(&inventory, &target).await.unwrap();
        assert_eq!(resolved.port, 8000);
        assert_eq!(resolved.source, PortSource::TargetPort);
    }

    #[tokio::test]
    async fn test_unknown_named_port_falls_back_to_declared() {
        let inventory = inventory_with(
            service(Some(TargetPort::Name("grpc".into()))),
            vec![pod("api-0", PodPhase::Running, "api")],
        );

        let target = TunnelTarget::service("prod", "api", 8080, 80);
        let resolved = resolve(&inventory, &target).await.unwrap();
        assert_eq!(resolved.port, 80);
        assert!(matches!(resolved.source, PortSource::Fallback(_)));
    }

    #[tokio::test]
    async fn test_undeclared_service_port_falls_back() {
        let inventory = inventory_with(
            service(Some(TargetPort::Number(8000))),
            vec![pod("api-0", PodPhase::Running, "api")],
        );

        let target = TunnelTarget::service("prod", "api", 9443, 443);
        let resolved = resolve(&inventory, &target).await.unwrap();
        assert_eq!(resolved.port, 443);
    }

    #[tokio::test]
    async fn test_first_running_backend_wins() {
        let inventory = inventory_with(
            service(Some(TargetPort::Number(8000))),
            vec![
                pod("other-0", PodPhase::Running, "other"),
                pod("api-0", PodPhase::Pending, "api"),
                pod("api-1", PodPhase::Running, "api"),
                pod("api-2", PodPhase::Running, "api"),
            ],
        );

        let target = TunnelTarget::service("prod", "api", 8080, 80);
        let resolved = resolve(&inventory, &target).await.unwrap();
        assert_eq!(resolved.pod, "api-1");
    }

    #[tokio::test]
    async fn test_no_running_backends_fails_closed() {
        let inventory = inventory_with(
            service(Some(TargetPort::Number(8000))),
            vec![
                pod("api-0", PodPhase::Pending, "api"),
                pod("api-1", PodPhase::Failed, "api"),
            ],
        );

        let target = TunnelTarget::service("prod", "api", 8080, 80);
        let err = resolve(&inventory, &target).await.unwrap_err();
        assert_eq!(err, ForwardError::NoRunningBackends("api".into()));
    }

    #[tokio::test]
    async fn test_no_backends() {
        let inventory = inventory_with(
            service(Some(TargetPort::Number(8000))),
            vec![pod("web-0", PodPhase::Running, "web")],
        );

        let target = TunnelTarget::service("prod", "api", 8080, 80);
        let err = resolve(&inventory, &target).await.unwrap_err();
        assert_eq!(err, ForwardError::NoBackends("api".into()));
    }

    #[tokio::test]
    async fn test_service_without_selector() {
        let mut svc = service(None);
        svc.selector.clear();
        let mut inventory = MockInventory::new();
        inventory
            .expect_get_service()
            .returning(move |_, _| Ok(svc.clone()));
        inventory.expect_list_pods().never();

        let target = TunnelTarget::service("prod", "api", 8080, 80);
        let err = resolve(&inventory, &target).await.unwrap_err();
        assert_eq!(err, ForwardError::NoSelector("api".into()));
    }

    #[tokio::test]
    async fn test_probe_service_only_checks_existence() {
        let mut inventory = MockInventory::new();
        inventory
            .expect_get_service()
            .returning(|_, _| Ok(service(None)));
        inventory.expect_list_pods().never();

        let target = TunnelTarget::service("prod", "api", 8080, 80);
        assert!(probe(&inventory, &target).await.is_ok());
    }
}
