//! In-memory inventory and tunnel fakes
//!
//! Enabled for this crate's tests and, through the `testing` feature, for
//! downstream crates that drive a manager without a cluster.

use crate::error::{ForwardError, InventoryError};
use crate::identity::ResourceKind;
use crate::inventory::{
    ContainerPort, Inventory, PodInfo, PodPhase, ServiceInfo, ServicePort, TargetPort,
};
use crate::tunnel::{tunnel_channel, OpenedTunnel, StopSignal, TunnelOpener, TunnelSpec};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn label_map(labels: &[(&str, &str)]) -> BTreeMap<String, String> {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A pod with one container exposing `http` on 8000
pub fn pod(namespace: &str, name: &str, phase: PodPhase, labels: &[(&str, &str)]) -> PodInfo {
    PodInfo {
        name: name.to_string(),
        namespace: namespace.to_string(),
        phase,
        labels: label_map(labels),
        ports: vec![ContainerPort {
            container: "main".to_string(),
            name: Some("http".to_string()),
            port: 8000,
            protocol: "TCP".to_string(),
        }],
    }
}

/// A ClusterIP service with a single port
pub fn service(
    namespace: &str,
    name: &str,
    selector: &[(&str, &str)],
    port: u16,
    target_port: Option<TargetPort>,
) -> ServiceInfo {
    ServiceInfo {
        name: name.to_string(),
        namespace: namespace.to_string(),
        service_type: "ClusterIP".to_string(),
        selector: label_map(selector),
        ports: vec![ServicePort {
            name: None,
            port,
            target_port,
            protocol: "TCP".to_string(),
        }],
    }
}

#[derive(Default)]
struct FakeCluster {
    pods: Vec<PodInfo>,
    services: Vec<ServiceInfo>,
}

/// Mutable in-memory cluster
#[derive(Default)]
pub struct FakeInventory {
    cluster: Mutex<FakeCluster>,
}

impl FakeInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pod(&self, pod: PodInfo) {
        lock(&self.cluster).pods.push(pod);
    }

    pub fn add_service(&self, service: ServiceInfo) {
        lock(&self.cluster).services.push(service);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        lock(&self.cluster)
            .pods
            .retain(|p| !(p.namespace == namespace && p.name == name));
    }

    pub fn set_phase(&self, namespace: &str, name: &str, phase: PodPhase) {
        let mut cluster = lock(&self.cluster);
        for pod in cluster
            .pods
            .iter_mut()
            .filter(|p| p.namespace == namespace && p.name == name)
        {
            pod.phase = phase.clone();
        }
    }
}

#[async_trait]
impl Inventory for FakeInventory {
    async fn list_namespaces(&self) -> Result<Vec<String>, InventoryError> {
        let cluster = lock(&self.cluster);
        let mut namespaces: Vec<String> = cluster
            .pods
            .iter()
            .map(|p| p.namespace.clone())
            .chain(cluster.services.iter().map(|s| s.namespace.clone()))
            .collect();
        namespaces.sort();
        namespaces.dedup();
        Ok(namespaces)
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodInfo>, InventoryError> {
        Ok(lock(&self.cluster)
            .pods
            .iter()
            .filter(|p| p.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<ServiceInfo>, InventoryError> {
        Ok(lock(&self.cluster)
            .services
            .iter()
            .filter(|s| s.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodInfo, InventoryError> {
        lock(&self.cluster)
            .pods
            .iter()
            .find(|p| p.namespace == namespace && p.name == name)
            .cloned()
            .ok_or_else(|| InventoryError::NotFound {
                kind: ResourceKind::Pod,
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<ServiceInfo, InventoryError> {
        lock(&self.cluster)
            .services
            .iter()
            .find(|s| s.namespace == namespace && s.name == name)
            .cloned()
            .ok_or_else(|| InventoryError::NotFound {
                kind: ResourceKind::Service,
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }
}

/// How the next opened tunnel behaves
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TunnelBehavior {
    /// Ready at once, exits cleanly on stop, fails when broken
    #[default]
    Ready,
    /// Exits with a transport error before readiness
    FailBeforeReady(String),
    /// Never becomes ready, exits cleanly on stop
    NeverReady,
    /// Ready at once, then ignores the stop signal entirely
    IgnoreStop,
}

/// Scripted tunnel opener
#[derive(Default)]
pub struct FakeOpener {
    behavior: Mutex<TunnelBehavior>,
    opened: Mutex<Vec<(String, u16, u16)>>,
    breakers: Mutex<HashMap<u16, oneshot::Sender<String>>>,
}

impl FakeOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, behavior: TunnelBehavior) {
        *lock(&self.behavior) = behavior;
    }

    /// `(pod, local port, remote port)` for every open call so far
    pub fn opened(&self) -> Vec<(String, u16, u16)> {
        lock(&self.opened).clone()
    }

    /// Make the tunnel on `local_port` fail with `message`
    pub fn break_tunnel(&self, local_port: u16, message: &str) -> bool {
        match lock(&self.breakers).remove(&local_port) {
            Some(tx) => tx.send(message.to_string()).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl TunnelOpener for FakeOpener {
    async fn open(&self, spec: TunnelSpec, stop: StopSignal) -> Result<OpenedTunnel, ForwardError> {
        let local_port = spec.bind_addr.port();
        lock(&self.opened).push((spec.pod.clone(), local_port, spec.remote_port));

        let (breaker_tx, breaker_rx) = oneshot::channel::<String>();
        lock(&self.breakers).insert(local_port, breaker_tx);

        let (mut signals, opened) = tunnel_channel();
        let behavior = lock(&self.behavior).clone();
        match behavior {
            TunnelBehavior::FailBeforeReady(message) => {
                signals.exit(Err(ForwardError::Transport(message)));
            }
            TunnelBehavior::NeverReady => {
                tokio::spawn(async move {
                    stop.closed().await;
                    signals.exit(Ok(()));
                });
            }
            TunnelBehavior::Ready => {
                tokio::spawn(async move {
                    signals.ready();
                    spec.log.log(format!("Listening on {}", spec.bind_addr));
                    tokio::select! {
                        _ = stop.closed() => signals.exit(Ok(())),
                        broken = breaker_rx => match broken {
                            Ok(message) => signals.exit(Err(ForwardError::Transport(message))),
                            Err(_) => signals.exit(Ok(())),
                        },
                    }
                });
            }
            TunnelBehavior::IgnoreStop => {
                drop(breaker_rx);
                tokio::spawn(async move {
                    signals.ready();
                    // Holding the exit sender means the worker never sees an exit
                    let _held = signals;
                    std::future::pending::<()>().await;
                });
            }
        }
        Ok(opened)
    }
}
