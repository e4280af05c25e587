use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::executor::Target;

/// Where and how to reach the clusters.
#[derive(Clone, Debug, Default)]
pub struct ClusterOptions {
    pub kubeconfig: Option<PathBuf>,
    /// Contexts to multiplex over; empty means the current context.
    pub contexts: Vec<String>,
    pub namespace: Option<String>,
    pub all_namespaces: bool,
}

/// One cluster context with its client and the namespace to work in.
#[derive(Clone)]
pub struct Kube {
    pub context: String,
    /// `None` means all namespaces.
    pub namespace: Option<String>,
    pub client: Client,
}

impl Target for Kube {
    fn name(&self) -> &str {
        &self.context
    }
}

/// Build one client per requested context.
#[tracing::instrument]
pub async fn connect(options: &ClusterOptions) -> Result<Vec<Kube>> {
    let kubeconfig = match &options.kubeconfig {
        Some(path) => Some(
            Kubeconfig::read_from(path)
                .map_err(|e| Error::Kubeconfig(format!("read {}: {}", path.display(), e)))?,
        ),
        None => None,
    };

    let contexts: Vec<Option<String>> = if options.contexts.is_empty() {
        vec![None]
    } else {
        options.contexts.iter().cloned().map(Some).collect()
    };

    let mut clients = Vec::with_capacity(contexts.len());
    for context in contexts {
        let kube_options = KubeConfigOptions {
            context: context.clone(),
            cluster: None,
            user: None,
        };

        let config = match &kubeconfig {
            Some(kubeconfig) => Config::from_custom_kubeconfig(kubeconfig.clone(), &kube_options).await,
            None => Config::from_kubeconfig(&kube_options).await,
        }
        .map_err(|e| Error::Kubeconfig(e.to_string()))?;

        let namespace = if options.all_namespaces {
            None
        } else {
            Some(
                options
                    .namespace
                    .clone()
                    .unwrap_or_else(|| config.default_namespace.clone()),
            )
        };

        let client = Client::try_from(config).map_err(|e| Error::Kubeconfig(e.to_string()))?;

        clients.push(Kube {
            context: context.unwrap_or_else(|| "current".to_string()),
            namespace,
            client,
        });
    }

    Ok(clients)
}
