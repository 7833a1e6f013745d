//! Tracing initialisation with TASKBRIDGE_LOG and LOG_FORMAT support.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn base_level(raw: Option<&str>) -> &'static str {
    match raw {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn default_filter(level: &str) -> String {
    format!("taskbridge={level},taskbridge_cli={level}", level = level)
}

/// Install the global subscriber. Safe to call more than once.
///
/// `RUST_LOG` wins when set. Otherwise `TASKBRIDGE_LOG` picks the level for
/// the workspace crates. `LOG_FORMAT=json` switches to JSON lines on stderr.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var("TASKBRIDGE_LOG").ok().as_deref());
        EnvFilter::new(default_filter(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_defaults_to_info() {
        assert_eq!(base_level(None), "info");
        assert_eq!(base_level(Some("verbose")), "info");
    }

    #[test]
    fn level_accepts_warning_alias() {
        assert_eq!(base_level(Some("warning")), "warn");
        assert_eq!(base_level(Some("debug")), "debug");
    }

    #[test]
    fn filter_scopes_workspace_crates() {
        let filter = default_filter("debug");
        assert!(filter.contains("taskbridge=debug"));
        assert!(filter.contains("taskbridge_cli=debug"));
    }

    #[test]
    fn init_twice_is_harmless() {
        init_tracing();
        init_tracing();
    }
}
