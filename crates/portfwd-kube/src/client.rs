use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KubeError {
    #[error("failed to load Kubernetes configuration: {0}")]
    Config(String),

    #[error("failed to create Kubernetes client: {0}")]
    Client(#[from] kube::Error),
}

/// Build a client from the standard kubeconfig resolution
///
/// With `context` set, that kubeconfig context is used instead of the current one.
pub async fn connect(context: Option<&str>) -> Result<Client, KubeError> {
    let config = match context {
        Some(context) => {
            let options = KubeConfigOptions {
                context: Some(context.to_string()),
                ..Default::default()
            };
            Config::from_kubeconfig(&options)
                .await
                .map_err(|e| KubeError::Config(e.to_string()))?
        }
        None => Config::infer()
            .await
            .map_err(|e| KubeError::Config(e.to_string()))?,
    };

    tracing::debug!(cluster_url = %config.cluster_url, "Connecting to Kubernetes API");
    Ok(Client::try_from(config)?)
}
