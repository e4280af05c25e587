//! Error types for kubemux-client.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for kubemux operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while attaching to pods.
///
/// `Watch`, `Resolve`, `UnknownResource`, `Kubeconfig` and `Bind` are setup
/// failures and abort the invoking command. `Log` and `Tunnel` stay local to
/// one pod session.
#[derive(Error, Debug)]
pub enum Error {
    /// The pod watch could not be established.
    #[error("watch pods: {0}")]
    Watch(#[source] kube::Error),

    /// The workload to follow could not be looked up.
    #[error("get {kind} {name}: {source}")]
    Resolve {
        kind: &'static str,
        name: String,
        #[source]
        source: kube::Error,
    },

    /// The workload exists but carries no usable pod selector.
    #[error("{kind} {name} has no pod selector")]
    NoSelector { kind: &'static str, name: String },

    /// The resource type is not one pods can be derived from.
    #[error("unhandled resource type `{0}`")]
    UnknownResource(String),

    /// A container log stream failed.
    #[error("log stream for {pod}/{container}: {source}")]
    Log {
        pod: String,
        container: String,
        #[source]
        source: kube::Error,
    },

    /// A remote port-forward failed.
    #[error("port-forward to {pod}: {reason}")]
    Tunnel { pod: String, reason: String },

    /// A local listener could not be bound.
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The kubeconfig could not be read or turned into a client.
    #[error("kubeconfig: {0}")]
    Kubeconfig(String),

    /// Relay-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn tunnel(pod: &str, reason: impl ToString) -> Self {
        Error::Tunnel {
            pod: pod.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        Error::Bind {
            addr: addr.to_string(),
            source,
        }
    }
}
