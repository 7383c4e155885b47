//! Logging initialization.
//!
//! Logs go to stderr so that stdout stays reserved for the stdout sink.
//! `RUST_LOG` overrides the default level.

use tracing_subscriber::EnvFilter;

/// Default filter directive for the given verbosity.
fn default_directive(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Install the global tracing subscriber.
///
/// With `log_time` off, lines carry no timestamp (journald adds its own).
pub fn init(log_time: bool, verbose: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_writer(std::io::stderr)
        .with_target(verbose);

    // `try_init` fails only if a subscriber is already set, e.g. in tests.
    let _ = if log_time {
        builder.try_init()
    } else {
        builder.without_time().try_init()
    };
}
