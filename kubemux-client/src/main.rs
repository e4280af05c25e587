//! kubemux - follow logs of, and port-forward to, whatever pods currently
//! back a workload, on one or more clusters at once.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kubemux_client::cmd::log_session::{parse_duration, LogSession};
use kubemux_client::cmd::portforward::TunnelSession;
use kubemux_client::filter::{Level, LineFilter};
use kubemux_client::structs::{ForwardOptions, LogOptions};
use kubemux_client::{attach, connect, execute, selector_for, ClusterOptions, ForwardPool, Kube};

#[derive(Parser)]
#[command(name = "kubemux")]
#[command(author, version, about = "Follow the pods behind a workload across restarts and clusters")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the kubeconfig file
    #[arg(long, global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Contexts to run against (comma separated or repeated)
    #[arg(long = "context", global = true, env = "KUBEMUX_CONTEXT", value_delimiter = ',')]
    contexts: Vec<String>,

    /// Namespace; defaults to the one set on each context
    #[arg(short, long, global = true, env = "KUBEMUX_NAMESPACE")]
    namespace: Option<String>,

    /// Watch pods in every namespace
    #[arg(short = 'A', long, global = true, conflicts_with = "namespace")]
    all_namespaces: bool,

    /// Also write logs to kubemux.log in this directory
    #[arg(long, global = true, env = "KUBEMUX_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// OTLP collector, used when built with the `telemetry` feature
    #[arg(long, global = true, env = "OTEL_EXPORTER_OTLP_ENDPOINT", default_value = "http://localhost:4317")]
    otlp_endpoint: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream logs of every pod behind a resource
    #[command(alias = "logs")]
    Log(LogArgs),

    /// Forward a fixed local port to whichever pods are running
    #[command(alias = "pf")]
    PortForward(ForwardArgs),

    /// Show server version and namespace of every context
    Info,
}

#[derive(Args)]
struct LogArgs {
    /// Resource type (po, deploy, ds, sts, rs, job, svc, label)
    resource_type: String,
    /// Resource name, or a label selector for `label`
    name: String,

    /// Only return logs newer than this (30s, 5m, 1h, 2d; 0 for all)
    #[arg(long, default_value = "1h", value_parser = parse_duration)]
    since: Duration,

    /// Only follow containers whose name matches
    #[arg(short, long, value_parser = Regex::new)]
    container: Option<Regex>,

    /// Only emit lines matching this pattern
    #[arg(short, long, value_parser = Regex::new)]
    grep: Option<Regex>,

    /// Emit lines NOT matching --grep instead
    #[arg(short = 'v', long, requires = "grep")]
    invert: bool,

    /// Drop structured lines below this level
    #[arg(long)]
    level: Option<Level>,

    /// JSON keys holding the level (default: level, severity)
    #[arg(long = "level-key")]
    level_keys: Vec<String>,

    /// Bare lines without pod prefix or markers
    #[arg(short, long)]
    raw: bool,

    /// Only report the containers that would be followed
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct ForwardArgs {
    /// Resource type (po, deploy, ds, sts, rs, job, svc, label)
    resource_type: String,
    /// Resource name, or a label selector for `label`
    name: String,
    local_port: u16,
    remote_port: u16,

    /// Local address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    address: IpAddr,

    /// Only report the pods that would be forwarded to
    #[arg(long)]
    dry_run: bool,
}

impl LogArgs {
    fn options(&self) -> LogOptions {
        let mut filter = LineFilter {
            threshold: self.level,
            pattern: self.grep.clone(),
            invert: self.invert,
            ..LineFilter::default()
        };
        if !self.level_keys.is_empty() {
            filter.level_keys = self.level_keys.clone();
        }

        LogOptions {
            since: self.since,
            container: self.container.clone(),
            filter,
            raw: self.raw,
            dry_run: self.dry_run,
        }
    }
}

impl ForwardArgs {
    fn options(&self) -> ForwardOptions {
        ForwardOptions {
            address: self.address,
            local_port: self.local_port,
            remote_port: self.remote_port,
            dry_run: self.dry_run,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = kubemux_client::setup_logger(cli.log_dir.as_deref(), &cli.otlp_endpoint) {
        eprintln!("kubemux: logging disabled: {e}");
    }

    let result = run(cli).await;
    kubemux_client::shutdown_logger();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cluster = ClusterOptions {
        kubeconfig: cli.kubeconfig,
        contexts: cli.contexts,
        namespace: cli.namespace,
        all_namespaces: cli.all_namespaces,
    };
    let targets = connect(&cluster).await.context("connecting to clusters")?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    match cli.command {
        Commands::Log(args) => follow_logs(&targets, &args, cancel).await,
        Commands::PortForward(args) => port_forward(&targets, &args, cancel).await,
        Commands::Info => show_info(&targets).await,
    }
}

async fn follow_logs(targets: &[Kube], args: &LogArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    let options = args.options();
    let multi = targets.len() > 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = stdout.flush().await;
    });

    let failed = execute(targets, |kube| {
        let kube = kube.clone();
        let cancel = cancel.clone();
        let mut session = LogSession::new(kube.client.clone(), options.clone(), tx.clone());
        if multi {
            session = session.with_context(kube.context.clone());
        }
        let (resource_type, name) = (args.resource_type.clone(), args.name.clone());
        async move {
            let selector = selector_for(&kube.client, kube.namespace.as_deref(), &resource_type, &name).await?;
            attach(&kube, &selector, Arc::new(session), cancel).await
        }
    })
    .await;

    drop(tx);
    printer.await?;
    all_failed(targets, &failed)
}

async fn port_forward(targets: &[Kube], args: &ForwardArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    let options = args.options();
    let pool = Arc::new(ForwardPool::new());

    let serving = if options.dry_run {
        None
    } else {
        let addr = SocketAddr::new(options.address, options.local_port);
        let listener = ForwardPool::bind(addr).await?;
        info!(
            "Forwarding {} to {}/{} port {}",
            addr, args.resource_type, args.name, options.remote_port
        );
        let pool = pool.clone();
        let cancel = cancel.clone();
        Some(tokio::spawn(async move { pool.serve(listener, cancel).await }))
    };

    let failed = execute(targets, |kube| {
        let kube = kube.clone();
        let cancel = cancel.clone();
        let session = TunnelSession::new(kube.client.clone(), pool.clone(), options.remote_port)
            .dry_run(options.dry_run);
        let (resource_type, name) = (args.resource_type.clone(), args.name.clone());
        async move {
            let selector = selector_for(&kube.client, kube.namespace.as_deref(), &resource_type, &name).await?;
            attach(&kube, &selector, Arc::new(session), cancel).await
        }
    })
    .await;

    // Every watch is gone; nothing can register a backend anymore.
    cancel.cancel();
    if let Some(serving) = serving {
        serving.await?;
        pool.done().await;
    }

    all_failed(targets, &failed)
}

async fn show_info(targets: &[Kube]) -> anyhow::Result<()> {
    let failed = execute(targets, |kube| {
        let kube = kube.clone();
        async move {
            let version = kube.client.apiserver_version().await?;
            println!(
                "{}\t{}\t{}",
                kube.context,
                version.git_version,
                kube.namespace.as_deref().unwrap_or("(all namespaces)")
            );
            Ok::<(), kube::Error>(())
        }
    })
    .await;

    all_failed(targets, &failed)
}

fn all_failed(targets: &[Kube], failed: &[String]) -> anyhow::Result<()> {
    if !failed.is_empty() && failed.len() == targets.len() {
        bail!("every target failed: {}", failed.join(", "));
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        res = signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("cannot listen for ctrl-c: {}", e);
                return;
            }
        }
        _ = terminate => {}
    }

    info!("Shutting down");
    cancel.cancel();
}
