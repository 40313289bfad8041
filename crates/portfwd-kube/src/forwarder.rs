use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use portfwd_core::{
    tunnel_channel, ForwardError, OpenedTunnel, StopSignal, TunnelOpener, TunnelSpec,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Opens tunnels through the API server's pod port-forward endpoint
#[derive(Clone)]
pub struct KubePortForwarder {
    client: Client,
}

impl KubePortForwarder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TunnelOpener for KubePortForwarder {
    async fn open(
        &self,
        spec: TunnelSpec,
        stop: StopSignal,
    ) -> Result<OpenedTunnel, ForwardError> {
        let listener = TcpListener::bind(spec.bind_addr).await.map_err(|e| {
            ForwardError::Transport(format!("failed to listen on {}: {}", spec.bind_addr, e))
        })?;
        spec.log.log(format!("Listening on {}", spec.bind_addr));

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &spec.namespace);
        let (mut signals, opened) = tunnel_channel();

        tokio::spawn(async move {
            signals.ready();
            let result = serve(listener, pods, &spec, &stop).await;
            signals.exit(result);
        });

        Ok(opened)
    }
}

/// Accept loop; returns when stopped or when the backend pod goes away
async fn serve(
    listener: TcpListener,
    pods: Api<Pod>,
    spec: &TunnelSpec,
    stop: &StopSignal,
) -> Result<(), ForwardError> {
    let (failed_tx, mut failed_rx) = mpsc::channel::<String>(16);

    loop {
        tokio::select! {
            _ = stop.closed() => return Ok(()),
            accepted = listener.accept() => {
                let (socket, peer) = accepted
                    .map_err(|e| ForwardError::Transport(format!("accept failed: {}", e)))?;
                debug!(peer = %peer, pod = %spec.pod, "Accepted connection");

                let pods = pods.clone();
                let pod = spec.pod.clone();
                let port = spec.remote_port;
                let failed = failed_tx.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = stop.closed() => {}
                        result = forward_connection(&pods, &pod, port, socket) => {
                            if let Err(reason) = result {
                                let _ = failed.send(reason).await;
                            }
                        }
                    }
                });
            }
            Some(reason) = failed_rx.recv() => {
                warn!(pod = %spec.pod, "Connection error: {}", reason);
                spec.log.log(format!("Connection error: {}", reason));
                check_backend(&pods, &spec.pod).await?;
            }
        }
    }
}

async fn forward_connection(
    pods: &Api<Pod>,
    pod: &str,
    port: u16,
    mut socket: TcpStream,
) -> Result<(), String> {
    let mut forwarder = pods
        .portforward(pod, &[port])
        .await
        .map_err(|e| format!("failed to open port-forward to {}:{}: {}", pod, port, e))?;
    let mut upstream = forwarder
        .take_stream(port)
        .ok_or_else(|| format!("port {} not available on forwarder", port))?;

    tokio::io::copy_bidirectional(&mut socket, &mut upstream)
        .await
        .map_err(|e| e.to_string())?;

    drop(upstream);
    forwarder.join().await.map_err(|e| e.to_string())
}

/// Fail the tunnel if its backend pod disappeared or stopped running
async fn check_backend(pods: &Api<Pod>, name: &str) -> Result<(), ForwardError> {
    match pods.get(name).await {
        Ok(pod) => {
            let phase = pod
                .status
                .and_then(|status| status.phase)
                .unwrap_or_else(|| "Unknown".to_string());
            if phase == "Running" {
                Ok(())
            } else {
                Err(ForwardError::Transport(format!(
                    "pod {} is no longer running (phase: {})",
                    name, phase
                )))
            }
        }
        Err(kube::Error::Api(response)) if response.code == 404 => Err(
            ForwardError::Transport(format!("pod {} no longer exists", name)),
        ),
        Err(e) => {
            // API hiccups alone don't tear the tunnel down
            warn!(pod = %name, error = %e, "Could not check backend pod");
            Ok(())
        }
    }
}
