//! Tracing setup for binaries embedding the bridge.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence when set. Otherwise `TETHER_LOG` picks the
/// crate's level (debug, info, warn, error; default info). `LOG_FORMAT=json`
/// switches to JSON lines. Does nothing if a subscriber is already installed.
///
/// Output goes to stderr because stdout is often the transport itself.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = level_from(std::env::var("TETHER_LOG").ok().as_deref());
        EnvFilter::new(format!("tether={level}"))
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

    tracing::debug!(version = crate::VERSION, "Tracing initialized");
}

fn level_from(value: Option<&str>) -> &'static str {
    match value {
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}
