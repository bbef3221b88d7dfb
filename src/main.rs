use std::{env, panic, process};

use backtrace::Backtrace;
use clap::Parser;

use libazul::cli::Options;
use libazul::logging;

fn main() {
    panic::set_hook(Box::new(|panic_info| {
        let message = match panic_info.payload().downcast_ref::<&str>() {
            Some(&message) => message.to_string(),
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(message) => message.clone(),
                None => "<no message>".to_string(),
            },
        };

        log::error!(
            "Azul crashed! You are running Azul {}.",
            env!("CARGO_PKG_VERSION")
        );
        log::error!("This is probably an Azul bug.");
        log::error!("");
        log::error!(
            "Please consider filing an issue: {}/issues",
            env!("CARGO_PKG_REPOSITORY")
        );
        log::error!("");
        log::error!("Details: {}", message);

        if let Some(location) = panic_info.location() {
            log::error!("in file {} on line {}", location.file(), location.line());
        }

        let should_backtrace = env::var("RUST_BACKTRACE")
            .map(|var| var == "1")
            .unwrap_or(false);

        if should_backtrace {
            eprintln!("{:?}", Backtrace::new());
        } else {
            eprintln!(
                "note: run with `RUST_BACKTRACE=1` environment variable to display a backtrace."
            );
        }

        process::exit(1);
    }));

    let options = Options::parse();

    logging::init_logging(options.global.verbosity, options.global.color);

    if let Err(err) = options.run() {
        log::error!("{:?}", err);
        process::exit(1);
    }
}
