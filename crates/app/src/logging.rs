use std::io;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

const DEFAULT_LEVEL: LevelFilter = LevelFilter::INFO;

/// Installs a stderr `fmt` subscriber. Events from this workspace pass at
/// `level`; third-party targets are held to warnings.
pub(crate) fn setup_tracing(level: LevelFilter) {
    let filter_layer = tracing_subscriber::filter::filter_fn(move |metadata| {
        let effective = if metadata.target().starts_with("solidtree") {
            level
        } else {
            LevelFilter::WARN.min(level)
        };
        effective >= *metadata.level()
    });
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter_layer))
        .init();
}

pub(crate) fn level_from_args(args: &[String]) -> Result<LevelFilter, String> {
    let mut iter = args.iter();
    let mut level = DEFAULT_LEVEL;
    while let Some(arg) = iter.next() {
        if arg == "--log" {
            let value = iter
                .next()
                .ok_or_else(|| "--log requires a level".to_string())?;
            level = parse_level(value)?;
        }
    }
    Ok(level)
}

pub(crate) fn parse_level(value: &str) -> Result<LevelFilter, String> {
    match value.to_ascii_lowercase().as_str() {
        "off" => Ok(LevelFilter::OFF),
        "error" => Ok(LevelFilter::ERROR),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "info" => Ok(LevelFilter::INFO),
        "debug" => Ok(LevelFilter::DEBUG),
        "trace" => Ok(LevelFilter::TRACE),
        other => Err(format!("unknown log level {other}")),
    }
}
