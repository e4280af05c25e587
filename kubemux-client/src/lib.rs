//! Follow every pod behind a Kubernetes workload, across pod replacement and
//! across several clusters at once.
//!
//! A [`reconciler`] turns a pod watch into exactly one [`session::Session`]
//! per running pod. Sessions either tail container logs
//! ([`cmd::log_session`]) or front the pod with a local tunnel that a
//! [`pool::ForwardPool`] routes a fixed port to ([`cmd::portforward`]).

pub mod client;
pub mod cmd;
pub mod error;
pub mod executor;
pub mod filter;
pub mod pod;
pub mod pool;
pub mod reconciler;
pub mod resource;
pub mod session;
pub mod structs;
pub mod watch;

cfg_if::cfg_if! {
    if #[cfg(feature = "telemetry")] {
        use kubemux_telemetry as logging;
    } else {
        mod log;
        use log as logging;
    }
}

pub use logging::{setup_logger, shutdown as shutdown_logger};

pub use client::{connect, ClusterOptions, Kube};
pub use error::{Error, Result};
pub use executor::{execute, Target};
pub use pool::ForwardPool;
pub use reconciler::attach;
pub use resource::{selector_for, Selector};
