use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{Api, Client};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Identifies the pods behind a workload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    pub labels: Option<String>,
    pub fields: Option<String>,
}

impl Selector {
    pub fn labels(labels: impl Into<String>) -> Self {
        Self {
            labels: Some(labels.into()),
            fields: None,
        }
    }

    pub fn pod_name(name: &str) -> Self {
        Self {
            labels: None,
            fields: Some(format!("metadata.name={}", name)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Pod,
    Deployment,
    DaemonSet,
    StatefulSet,
    ReplicaSet,
    Job,
    Service,
    Labels,
}

const RESOURCE_KINDS: &[(&[&str], ResourceKind)] = &[
    (&["po", "pod", "pods"], ResourceKind::Pod),
    (&["deploy", "deployment", "deployments"], ResourceKind::Deployment),
    (&["ds", "daemonset", "daemonsets"], ResourceKind::DaemonSet),
    (&["sts", "statefulset", "statefulsets"], ResourceKind::StatefulSet),
    (&["rs", "replicaset", "replicasets"], ResourceKind::ReplicaSet),
    (&["job", "jobs"], ResourceKind::Job),
    (&["svc", "service", "services"], ResourceKind::Service),
    (&["label", "labels", "selector"], ResourceKind::Labels),
];

impl ResourceKind {
    pub fn lookup(resource_type: &str) -> Result<Self> {
        let wanted = resource_type.to_ascii_lowercase();
        RESOURCE_KINDS
            .iter()
            .find(|(names, _)| names.contains(&wanted.as_str()))
            .map(|(_, kind)| *kind)
            .ok_or_else(|| Error::UnknownResource(resource_type.to_string()))
    }

    fn name(self) -> &'static str {
        match self {
            ResourceKind::Pod => "pod",
            ResourceKind::Deployment => "deployment",
            ResourceKind::DaemonSet => "daemonset",
            ResourceKind::StatefulSet => "statefulset",
            ResourceKind::ReplicaSet => "replicaset",
            ResourceKind::Job => "job",
            ResourceKind::Service => "service",
            ResourceKind::Labels => "selector",
        }
    }
}

/// Resolve `resource_type`/`name` into the selector of the pods it manages.
#[tracing::instrument(skip(client))]
pub async fn selector_for(
    client: &Client,
    namespace: Option<&str>,
    resource_type: &str,
    name: &str,
) -> Result<Selector> {
    let kind = ResourceKind::lookup(resource_type)?;

    let labels = match kind {
        ResourceKind::Pod => return Ok(Selector::pod_name(name)),
        ResourceKind::Labels => return Ok(Selector::labels(name)),
        ResourceKind::Deployment => {
            let d: Deployment = get(client, namespace, kind, name).await?;
            d.spec.map(|s| render_label_selector(&s.selector))
        }
        ResourceKind::DaemonSet => {
            let d: DaemonSet = get(client, namespace, kind, name).await?;
            d.spec.map(|s| render_label_selector(&s.selector))
        }
        ResourceKind::StatefulSet => {
            let s: StatefulSet = get(client, namespace, kind, name).await?;
            s.spec.map(|s| render_label_selector(&s.selector))
        }
        ResourceKind::ReplicaSet => {
            let r: ReplicaSet = get(client, namespace, kind, name).await?;
            r.spec.map(|s| render_label_selector(&s.selector))
        }
        ResourceKind::Job => {
            let j: Job = get(client, namespace, kind, name).await?;
            j.spec
                .and_then(|s| s.selector)
                .map(|s| render_label_selector(&s))
        }
        ResourceKind::Service => {
            let s: Service = get(client, namespace, kind, name).await?;
            s.spec.and_then(|s| s.selector).map(|m| render_match_labels(&m))
        }
    };

    match labels {
        Some(labels) if !labels.is_empty() => Ok(Selector::labels(labels)),
        _ => Err(Error::NoSelector {
            kind: kind.name(),
            name: name.to_string(),
        }),
    }
}

async fn get<K>(client: &Client, namespace: Option<&str>, kind: ResourceKind, name: &str) -> Result<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + k8s_openapi::serde::de::DeserializeOwned
        + std::fmt::Debug,
    <K as kube::Resource>::DynamicType: Default,
{
    let api: Api<K> = match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::default_namespaced(client.clone()),
    };

    api.get(name).await.map_err(|source| Error::Resolve {
        kind: kind.name(),
        name: name.to_string(),
        source,
    })
}

fn render_match_labels(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Render a `LabelSelector` in the API server's query syntax.
pub fn render_label_selector(selector: &LabelSelector) -> String {
    let mut parts = Vec::new();

    if let Some(labels) = &selector.match_labels {
        if !labels.is_empty() {
            parts.push(render_match_labels(labels));
        }
    }

    for req in selector.match_expressions.iter().flatten() {
        let values = req.values.as_deref().unwrap_or_default().join(",");
        let rendered = match req.operator.as_str() {
            "In" => format!("{} in ({})", req.key, values),
            "NotIn" => format!("{} notin ({})", req.key, values),
            "Exists" => req.key.clone(),
            "DoesNotExist" => format!("!{}", req.key),
            _ => continue,
        };
        parts.push(rendered);
    }

    parts.join(",")
}
