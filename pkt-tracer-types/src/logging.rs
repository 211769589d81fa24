use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

pub type FmtLayer =
    fmt::Layer<tracing_subscriber::Registry, fmt::format::DefaultFields, fmt::format::Format, BoxMakeWriter>;

pub type LogReloadHandle = reload::Handle<FmtLayer, tracing_subscriber::Registry>;

const DEFAULT_LOG_FILTER: &str = "info";

/// Installs a reloadable `tracing` subscriber writing to stdout, or to
/// `log_file` when set. Returns a handle the telemetry endpoint can use to
/// change the filter level at runtime without restarting the process.
pub fn init(level: &str, log_file: Option<&str>) -> LogReloadHandle {
    let writer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| panic!("failed to open log file {path}: {e}"));
            BoxMakeWriter::new(file)
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let layer = fmt::layer().with_writer(writer).with_ansi(log_file.is_none());
    let (reload_layer, handle): (reload::Layer<FmtLayer, tracing_subscriber::Registry>, LogReloadHandle) =
        reload::Layer::new(layer);

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry().with(reload_layer).with(filter).init();
    handle
}
