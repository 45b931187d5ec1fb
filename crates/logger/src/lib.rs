use std::env::var;

use tracing::{level_filters::LevelFilter, warn};
use tracing_subscriber::{Layer, filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing at INFO unless `RUST_LOG` says otherwise.
pub fn init() {
    initialize_tracing(LevelFilter::INFO);
}

/// Initialize tracing with a default level taken from configuration.
///
/// Unknown level names fall back to INFO. `RUST_LOG` still wins over the
/// default directive.
pub fn init_with_level(level: &str) {
    initialize_tracing(parse_level(level));
}

fn parse_level(level: &str) -> LevelFilter {
    level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO)
}

/// Initialize tracing subscriber with default configuration.
fn initialize_tracing(level: LevelFilter) {
    let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

    let log_format = var("RUST_LOG_FORMAT")
        .inspect_err(|error| {
            warn!("Failed to read RUST_LOG_FORMAT, falling back to default: {error}")
        })
        .unwrap_or_default();

    let log_layer = match log_format.as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_filter(env_filter)
            .boxed(),
        _ => tracing_subscriber::fmt::layer().compact().with_target(true).with_filter(env_filter).boxed(),
    };

    // A second init (tests, embedded use) keeps the first subscriber.
    let _ = tracing_subscriber::registry().with(log_layer).try_init();
}
