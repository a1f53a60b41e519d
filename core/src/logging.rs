//! Process-wide tracing setup.

use std::path::Path;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;

#[cfg(not(debug_assertions))]
const LOG_FILE_PREFIX: &str = "flowscope";

/// Install the global subscriber.
///
/// Debug builds log to stderr. Release builds write a daily rolling file under
/// `<storage_path>/logs`; the returned guard flushes it and must be held until
/// exit. Calling this twice is harmless: the second subscriber is discarded.
pub fn init_logging(
    #[cfg_attr(debug_assertions, allow(unused_variables))] storage_path: &Path,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = resolve_log_level();

    #[cfg(debug_assertions)]
    let guard = {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .try_init();
        None
    };

    #[cfg(not(debug_assertions))]
    let guard = {
        use anyhow::Context;

        let log_dir = storage_path.join("logs");
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
        let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(non_blocking)
            .try_init();
        Some(guard)
    };

    tracing::info!("flowscope core v{} logging at {}", crate::VERSION, level);
    Ok(guard)
}

/// Level from `RUST_LOG`, defaulting to `info`.
pub fn resolve_log_level() -> LevelFilter {
    match std::env::var("RUST_LOG") {
        Ok(val) => parse_level(&val),
        Err(_) => LevelFilter::INFO,
    }
}

fn parse_level(raw: &str) -> LevelFilter {
    match raw.trim().to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_parse() {
        assert_eq!(parse_level("TRACE"), LevelFilter::TRACE);
        assert_eq!(parse_level("warning"), LevelFilter::WARN);
        assert_eq!(parse_level(" error "), LevelFilter::ERROR);
        assert_eq!(parse_level("flowscope=debug"), LevelFilter::INFO);
    }

    #[test]
    fn init_twice_is_tolerated() {
        let dir = tempfile::tempdir().expect("temp dir");
        let _first = init_logging(dir.path()).expect("first init");
        let _second = init_logging(dir.path()).expect("second init");
    }
}
