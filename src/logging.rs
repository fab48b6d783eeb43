//! Subscriber setup for binaries embedding the client.
//!
//! The library only emits `tracing` events; nothing is printed unless the host installs a
//! subscriber, either its own or the one from [`init`].

use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive; overrides the verbosity default.
pub const LOG_ENV: &str = "CWCLI_LOG";

/// Default directive for a `-v` count: 0 → warn, 1 → info, 2 → debug, 3+ → trace.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn filter(verbosity: u8) -> EnvFilter {
    let default = default_directive(verbosity);
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default))
        .unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install a stderr fmt subscriber. Returns `false` if a global subscriber already exists.
pub fn init(verbosity: u8) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(verbosity))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .is_ok()
}
