//! Tracing subscriber setup for the `azpower` binary.
//!
//! Events go to stderr so stdout stays free for command output. An explicit
//! level wins over `RUST_LOG`; without either the crate logs at `info`.

use std::io;

use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_LEVEL: &str = "info";

/// Filter directives for `level`, keeping HTTP client chatter at `warn`.
#[must_use]
pub fn filter_directives(level: &str) -> String {
    format!("azpower={level},reqwest=warn,hyper=warn")
}

fn env_filter(log_level: Option<&str>) -> EnvFilter {
    if let Some(level) = log_level {
        return EnvFilter::new(filter_directives(level));
    }
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(DEFAULT_LEVEL)))
}

fn subscriber(log_level: Option<&str>) -> impl Subscriber + Send + Sync + 'static {
    tracing_subscriber::registry().with(env_filter(log_level)).with(
        fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false),
    )
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns [`TryInitError`] when a global subscriber is already installed.
pub fn init(log_level: Option<&str>) -> Result<(), TryInitError> {
    subscriber(log_level).try_init()
}
