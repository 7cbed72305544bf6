use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const LOG_FILE: &str = "switchyard.log";

pub struct LoggingHandle {
    pub run_id: String,
    pub guard: WorkerGuard,
}

fn filter_source() -> String {
    std::env::var("SWITCHYARD_LOG_FILTER")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_FILTER.to_string())
}

fn run_id() -> String {
    std::env::var("SWITCHYARD_RUN_ID").unwrap_or_else(|_| {
        format!(
            "pid-{}-{}",
            std::process::id(),
            switchyard_protocol::now_millis()
        )
    })
}

/// Install the global subscriber, writing to `<log_dir>/switchyard.log`.
///
/// Nothing is written to the terminal; in Local mode it belongs to the assistant.
pub fn init_logging(log_dir: &Path) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE);

    let filter = std::env::var("SWITCHYARD_LOG_FILTER")
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let format = std::env::var("SWITCHYARD_LOG_FORMAT").unwrap_or_else(|_| "json".into());

    let registry = tracing_subscriber::registry().with(filter);
    if format.eq_ignore_ascii_case("pretty") {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()?;
    }

    let run_id = run_id();
    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %log_path.display(),
        format = %format,
        filter = %filter_source(),
        run_id = %run_id,
    );

    Ok(LoggingHandle { run_id, guard })
}
