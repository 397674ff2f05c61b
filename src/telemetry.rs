//! Tracing setup for the server binary.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber: compact format on stderr, filtered by
/// the config directive when present, otherwise by `-v` verbosity with the
/// `LOG` environment variable taking precedence.
pub fn init(verbosity: u8, config: &LoggingConfig) {
    if !config.stdout {
        return;
    }

    let filter = match config.filter.as_deref() {
        Some(directive) if !directive.is_empty() => EnvFilter::new(directive),
        _ => EnvFilter::builder()
            .with_default_directive(level_from_verbosity(verbosity).into())
            .with_env_var("LOG")
            .from_env_lossy(),
    };

    let _ = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::INFO,
        1 => tracing::metadata::LevelFilter::DEBUG,
        _ => tracing::metadata::LevelFilter::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_from_verbosity(0), tracing::metadata::LevelFilter::INFO);
        assert_eq!(level_from_verbosity(1), tracing::metadata::LevelFilter::DEBUG);
        assert_eq!(level_from_verbosity(9), tracing::metadata::LevelFilter::TRACE);
    }
}
