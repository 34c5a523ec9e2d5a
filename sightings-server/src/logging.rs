//! Process-wide tracing subscriber.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Install the stderr subscriber. `RUST_LOG` directives override `level`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(level: &str) {
    let level = if LEVELS.contains(&level) {
        level
    } else {
        eprintln!("Invalid log level '{level}', defaulting to 'info'");
        "info"
    };

    let filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .unwrap_or_else(|_| LevelFilter::INFO.into()),
        )
        .parse_lossy(std::env::var("RUST_LOG").unwrap_or_default());

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_filter(filter))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging("debug");
        init_logging("bogus");
        tracing::info!("logging initialised");
    }
}
