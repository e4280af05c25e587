use futures::future::join_all;
use futures::stream::{self, BoxStream};
use futures::{AsyncBufRead, AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::LogParams;
use kube::{Api, Client};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::pod::PodRef;
use crate::session::Session;
use crate::structs::LogOptions;

pub type LineStream = BoxStream<'static, std::io::Result<String>>;

/// Opens the output of one container as a stream of lines.
pub trait LogSource: Send + Sync + 'static {
    fn lines(
        &self,
        pod: &PodRef,
        container: &str,
        since: Duration,
        follow: bool,
    ) -> impl Future<Output = Result<LineStream>> + Send;
}

impl LogSource for Client {
    async fn lines(
        &self,
        pod: &PodRef,
        container: &str,
        since: Duration,
        follow: bool,
    ) -> Result<LineStream> {
        let api: Api<Pod> = Api::namespaced(self.clone(), &pod.namespace);
        let since_seconds = match since.as_secs() {
            0 => None,
            secs => Some(secs as i64),
        };
        let lp = LogParams {
            follow,
            container: Some(container.to_string()),
            since_seconds,
            ..LogParams::default()
        };

        let stream = api
            .log_stream(&pod.name, &lp)
            .await
            .map_err(|source| Error::Log {
                pod: pod.name.clone(),
                container: container.to_string(),
                source,
            })?;

        Ok(lossy_lines(stream))
    }
}

/// Split `reader` on `\n`. Invalid UTF-8 is replaced rather than ending the
/// stream.
pub fn lossy_lines<R>(reader: R) -> LineStream
where
    R: AsyncBufRead + Send + 'static,
{
    stream::unfold(Box::pin(reader), |mut reader| async move {
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                Some((Ok(String::from_utf8_lossy(&buf).into_owned()), reader))
            }
            Err(e) => Some((Err(e), reader)),
        }
    })
    .boxed()
}

/// Tails the selected containers of a pod into a line channel.
pub struct LogSession<L> {
    source: L,
    options: LogOptions,
    tx: mpsc::UnboundedSender<String>,
    /// Cluster context shown in front of every line when several are followed.
    context: Option<String>,
}

impl<L: LogSource> LogSession<L> {
    pub fn new(source: L, options: LogOptions, tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            source,
            options,
            tx,
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    fn containers<'a>(&self, pod: &'a PodRef) -> Vec<&'a str> {
        pod.containers
            .iter()
            .map(String::as_str)
            .filter(|name| {
                self.options
                    .container
                    .as_ref()
                    .map_or(true, |re| re.is_match(name))
            })
            .collect()
    }

    fn prefix(&self, pod: &PodRef, container: &str) -> String {
        match &self.context {
            Some(context) => format!("[{}] [{}/{}]", context, pod.name, container),
            None => format!("[{}/{}]", pod.name, container),
        }
    }

    fn emit(&self, line: String) -> bool {
        self.tx.send(line).is_ok()
    }

    async fn tail(&self, pod: &PodRef, follow: bool, cancel: &CancellationToken) {
        let containers = self.containers(pod);

        if self.options.dry_run {
            for container in containers {
                self.emit(format!("{} Found!", self.prefix(pod, container)));
            }
            return;
        }

        let tails = containers.into_iter().map(|container| async move {
            if let Err(e) = self.tail_container(pod, container, follow, cancel).await {
                error!(pod = %pod.name, container = %container, "{}", e);
            }
        });
        join_all(tails).await;
    }

    async fn tail_container(
        &self,
        pod: &PodRef,
        container: &str,
        follow: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut lines = self
            .source
            .lines(pod, container, self.options.since, follow)
            .await?;

        let prefix = self.prefix(pod, container);
        if !self.options.raw {
            self.emit(format!("{} Log...", prefix));
        }

        let mut result = Ok(());
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = lines.next() => next,
            };

            match next {
                Some(Ok(line)) => {
                    if !self.options.filter.keep(&line) {
                        continue;
                    }
                    let out = if self.options.raw {
                        line
                    } else {
                        format!("{} {}", prefix, line)
                    };
                    if !self.emit(out) {
                        debug!(pod = %pod.name, container, "output closed");
                        break;
                    }
                }
                Some(Err(e)) => {
                    result = Err(Error::Io(e));
                    break;
                }
                None => break,
            }
        }

        if !self.options.raw {
            self.emit(format!("{} Log ended.", prefix));
        }
        result
    }
}

impl<L: LogSource> Session for LogSession<L> {
    fn accepts(&self, pod: &PodRef) -> bool {
        !self.containers(pod).is_empty()
    }

    async fn run(&self, cancel: CancellationToken, pod: PodRef) -> Result<()> {
        self.tail(&pod, true, &cancel).await;
        Ok(())
    }

    async fn run_once(&self, pod: PodRef) -> Result<()> {
        self.tail(&pod, false, &CancellationToken::new()).await;
        Ok(())
    }
}

/// Parse a look-back window such as `30s`, `5m`, `1h` or `2d`. `0` means
/// the whole log.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.len() < 2 || !s.is_ascii() {
        return Err(format!("invalid duration `{}`", s));
    }

    let (num_str, unit) = s.split_at(s.len() - 1);
    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("invalid duration `{}`", s))?;
    let scale = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return Err(format!("invalid duration unit in `{}` (expected s, m, h or d)", s)),
    };
    num.checked_mul(scale)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("invalid duration `{}`", s))
}
