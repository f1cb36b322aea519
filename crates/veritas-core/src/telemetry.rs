//! Tracing initialisation for the `veritas` binary.
//!
//! [`init_tracing`] installs the global subscriber: an `EnvFilter` plus a
//! `fmt` layer, human-readable or JSON lines. Only the first call in a
//! process takes effect.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `level` is used as the filter
/// directive (e.g. `info` or `veritas_review=debug`). An unparseable
/// directive falls back to `info`.
///
/// Logs go to stderr so `--format json` output on stdout stays clean.
pub fn init_tracing(json: bool, level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()
            .ok();
    }
}
