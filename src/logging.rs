//! Console logging for the daemon, built on tracing-subscriber behind the
//! `log` macros used everywhere else.

use std::io::{self, IsTerminal};

use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use crate::cli::ColorChoice;

pub fn init_logging(verbosity: u8, color: ColorChoice) {
    tracing_log::LogTracer::init().expect("Failed to set log tracer");

    let default_filter = match verbosity {
        0 => "info",
        1 => "info,libazul=debug",
        2 => "info,libazul=trace",
        _ => "trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let use_ansi = match color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => io::stderr().is_terminal(),
    };

    let console_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(use_ansi)
        .without_time()
        .with_target(false)
        .with_level(true)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(console_layer).init();
}
