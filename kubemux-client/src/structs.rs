use regex::Regex;
use std::net::IpAddr;
use std::time::Duration;

use crate::filter::LineFilter;

#[derive(Clone, Debug)]
pub struct LogOptions {
    /// Look-back window of every log stream.
    pub since: Duration,
    /// Only containers whose name matches are followed.
    pub container: Option<Regex>,
    pub filter: LineFilter,
    /// Bare lines, without `[pod/container]` prefix or start/end markers.
    pub raw: bool,
    /// Report matching containers instead of streaming them.
    pub dry_run: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            since: Duration::from_secs(3600),
            container: None,
            filter: LineFilter::default(),
            raw: false,
            dry_run: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ForwardOptions {
    pub address: IpAddr,
    pub local_port: u16,
    pub remote_port: u16,
    pub dry_run: bool,
}
