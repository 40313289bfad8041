use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ListParams;
use kube::{Api, Client};
use portfwd_core::inventory::{ContainerPort, ServicePort};
use portfwd_core::{
    Inventory, InventoryError, PodInfo, PodPhase, ResourceKind, ServiceInfo, TargetPort,
};

/// Inventory backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeInventory {
    client: Client,
}

impl KubeInventory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn api_error(kind: ResourceKind, namespace: &str, name: &str, err: kube::Error) -> InventoryError {
    match err {
        kube::Error::Api(response) if response.code == 404 => InventoryError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        other => InventoryError::Api(other.to_string()),
    }
}

fn list_error(what: &str, namespace: &str, err: kube::Error) -> InventoryError {
    InventoryError::Api(format!("failed to list {} in {}: {}", what, namespace, err))
}

#[async_trait]
impl Inventory for KubeInventory {
    async fn list_namespaces(&self) -> Result<Vec<String>, InventoryError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| InventoryError::Api(format!("failed to list namespaces: {}", e)))?;

        let mut names: Vec<String> = list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodInfo>, InventoryError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| list_error("pods", namespace, e))?;

        let mut pods: Vec<PodInfo> = list.items.iter().map(|pod| pod_info(pod, namespace)).collect();
        pods.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pods)
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<ServiceInfo>, InventoryError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| list_error("services", namespace, e))?;

        let mut services: Vec<ServiceInfo> = list
            .items
            .iter()
            .map(|svc| service_info(svc, namespace))
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodInfo, InventoryError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = api
            .get(name)
            .await
            .map_err(|e| api_error(ResourceKind::Pod, namespace, name, e))?;
        Ok(pod_info(&pod, namespace))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<ServiceInfo, InventoryError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let svc = api
            .get(name)
            .await
            .map_err(|e| api_error(ResourceKind::Service, namespace, name, e))?;
        Ok(service_info(&svc, namespace))
    }
}

fn port(value: i32) -> Option<u16> {
    u16::try_from(value).ok().filter(|p| *p != 0)
}

pub(crate) fn pod_info(pod: &Pod, namespace: &str) -> PodInfo {
    let phase = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .map(PodPhase::from)
        .unwrap_or(PodPhase::Unknown);

    let ports = pod
        .spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|container| {
            container.ports.iter().flatten().filter_map(move |p| {
                Some(ContainerPort {
                    container: container.name.clone(),
                    name: p.name.clone(),
                    port: port(p.container_port)?,
                    protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                })
            })
        })
        .collect();

    PodInfo {
        name: pod.metadata.name.clone().unwrap_or_default(),
        namespace: pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| namespace.to_string()),
        phase,
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        ports,
    }
}

pub(crate) fn service_info(svc: &Service, namespace: &str) -> ServiceInfo {
    let spec = svc.spec.as_ref();

    let ports = spec
        .and_then(|spec| spec.ports.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|p| {
            let target_port = match &p.target_port {
                Some(IntOrString::Int(n)) => port(*n).map(TargetPort::Number),
                Some(IntOrString::String(name)) => Some(TargetPort::Name(name.clone())),
                None => None,
            };
            Some(ServicePort {
                name: p.name.clone(),
                port: port(p.port)?,
                target_port,
                protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
            })
        })
        .collect();

    ServiceInfo {
        name: svc.metadata.name.clone().unwrap_or_default(),
        namespace: svc
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| namespace.to_string()),
        service_type: spec
            .and_then(|spec| spec.type_.clone())
            .unwrap_or_else(|| "ClusterIP".to_string()),
        selector: spec
            .and_then(|spec| spec.selector.clone())
            .unwrap_or_default(),
        ports,
    }
}
