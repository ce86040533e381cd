use tracing::Level;
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, registry, util::SubscriberInitExt};

/// Installs the global stdout logger. `verbose` lowers the level to DEBUG.
pub fn init_logger(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let filter = Targets::new()
        .with_target(env!("CARGO_PKG_NAME"), level)
        .with_default(Level::WARN);

    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(true)
        .with_target(verbose);

    // A second init (tests) leaves the first subscriber in place.
    let _ = registry().with(layer).with(filter).try_init();
}
