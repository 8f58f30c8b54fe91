//! Tracing setup for the repair agent binaries.
//!
//! Logs go to stderr so command output on stdout (plans, reports, JSON
//! status) stays machine-readable.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Dependencies that are noisy at `info` and below.
const QUIET_TARGETS: &[&str] = &["surrealdb", "surrealkv", "hyper", "reqwest", "rustls"];

/// Default filter directive for `level` when `RUST_LOG` is unset.
pub fn default_directive(level: Level) -> String {
    let mut directive = level.as_str().to_ascii_lowercase();
    if level > Level::WARN {
        for target in QUIET_TARGETS {
            directive.push_str(&format!(",{target}=warn"));
        }
    }
    directive
}

/// Install the global subscriber. Only the first call in a process has any
/// effect.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let registry = tracing_subscriber::registry().with(filter);
    let _ = if json {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer).try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_quiets_dependencies() {
        let directive = default_directive(Level::DEBUG);
        assert!(directive.starts_with("debug,"));
        assert!(directive.contains("surrealdb=warn"));
        assert_eq!(default_directive(Level::WARN), "warn");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(false, Level::WARN);
        init_tracing(true, Level::DEBUG);
    }
}
