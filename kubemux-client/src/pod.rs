use k8s_openapi::api::core::v1::Pod;
use std::fmt;

/// Lifecycle phase of a pod as reported in `status.phase`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// Succeeded and Failed pods never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// Immutable snapshot of a watched pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodRef {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub phase: PodPhase,
    /// Init containers first, then regular containers.
    pub containers: Vec<String>,
}

impl PodRef {
    pub fn new(uid: &str, name: &str, namespace: &str, phase: PodPhase) -> Self {
        Self {
            uid: uid.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            phase,
            containers: Vec::new(),
        }
    }

    pub fn with_containers<I, S>(mut self, containers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.containers = containers.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&Pod> for PodRef {
    fn from(pod: &Pod) -> Self {
        let meta = &pod.metadata;
        let phase = PodPhase::parse(pod.status.as_ref().and_then(|s| s.phase.as_deref()));

        let mut containers = Vec::new();
        if let Some(spec) = &pod.spec {
            if let Some(init) = &spec.init_containers {
                containers.extend(init.iter().map(|c| c.name.clone()));
            }
            containers.extend(spec.containers.iter().map(|c| c.name.clone()));
        }

        Self {
            uid: meta.uid.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            phase,
            containers,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    Error,
}

/// One change observed on a watched pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodEvent {
    pub kind: EventKind,
    pub pod: PodRef,
}

impl PodEvent {
    pub fn new(kind: EventKind, pod: PodRef) -> Self {
        Self { kind, pod }
    }
}
