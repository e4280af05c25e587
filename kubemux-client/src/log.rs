use std::{fs::File, path::Path, sync::OnceLock};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static TRACER: OnceLock<()> = OnceLock::new();
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LOG_ENV: &str = "KUBEMUX_LOG";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber: stderr always, plus `kubemux.log` under
/// `log_dir` when one is given. Repeated calls are no-ops.
pub fn setup_logger(
    log_dir: Option<&Path>,
    _endpoint: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    if TRACER.get().is_some() {
        return Ok(());
    }

    let file_layer = match log_dir {
        Some(dir) => {
            let file = File::create(dir.join("kubemux.log"))?;
            let (non_blocking_writer, guard) = tracing_appender::non_blocking(file);
            LOG_GUARD.set(guard).ok();
            Some(
                fmt::layer()
                    .with_line_number(true)
                    .with_ansi(false)
                    .with_writer(non_blocking_writer)
                    .with_filter(env_filter()),
            )
        }
        None => None,
    };

    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter());

    TRACER.get_or_init(|| {
        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(file_layer)
            .try_init()
            .ok();
    });

    Ok(())
}

/// Nothing to flush beyond the file writer, which flushes on exit.
pub fn shutdown() {}
