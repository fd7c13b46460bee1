//! Shared logging initialization for happy-control binaries.

use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

fn parse_level(raw: Option<&str>) -> tracing::Level {
    match raw.unwrap_or("info").to_ascii_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Initialize process-level tracing output from `HAPPY_LOG`.
///
/// Safe to call multiple times; only the first call installs the subscriber.
pub fn init() {
    let level = parse_level(std::env::var("HAPPY_LOG").ok().as_deref());
    init_with_level(level);
}

/// Initialize tracing with an explicit level, ignoring `HAPPY_LOG`.
pub fn init_with_level(level: tracing::Level) {
    if INIT.get().is_some() {
        return;
    }
    // Logs go to stderr so a daemon started in the foreground keeps stdout clean.
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
    let _ = INIT.set(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level(Some("DEBUG")), tracing::Level::DEBUG);
        assert_eq!(parse_level(Some("warn")), tracing::Level::WARN);
        assert_eq!(parse_level(Some("bogus")), tracing::Level::INFO);
        assert_eq!(parse_level(None), tracing::Level::INFO);
    }
}
