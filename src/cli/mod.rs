//! Defines Azul's CLI through clap types.

mod build;
mod pack;
mod push;
mod serve;

use std::str::FromStr;

use clap::Parser;
use thiserror::Error;

pub use self::build::{instances_from_sourcemap, BuildCommand};
pub use self::pack::PackCommand;
pub use self::push::PushCommand;
pub use self::serve::ServeCommand;

/// Command line options that Azul accepts, defined using the clap crate.
#[derive(Debug, Parser)]
#[clap(name = "Azul", version, about)]
pub struct Options {
    #[clap(flatten)]
    pub global: GlobalOptions,

    /// Subcommand to run in this invocation.
    #[clap(subcommand)]
    pub subcommand: Subcommand,
}

impl Options {
    pub fn run(self) -> anyhow::Result<()> {
        match self.subcommand {
            Subcommand::Serve(subcommand) => subcommand.run(),
            Subcommand::Build(subcommand) => subcommand.run(),
            Subcommand::Push(subcommand) => subcommand.run(),
            Subcommand::Pack(subcommand) => subcommand.run(),
        }
    }
}

#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Sets verbosity level. Can be specified multiple times.
    #[clap(long("verbose"), short, global(true), action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Set color behavior. Valid values are auto, always, and never.
    #[clap(long("color"), global(true), default_value("auto"))]
    pub color: ColorChoice,
}

#[derive(Debug, Clone, Copy)]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl FromStr for ColorChoice {
    type Err = ColorChoiceParseError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        match source {
            "auto" => Ok(ColorChoice::Auto),
            "always" => Ok(ColorChoice::Always),
            "never" => Ok(ColorChoice::Never),
            _ => Err(ColorChoiceParseError {
                attempted: source.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Error)]
#[error("Invalid color choice '{attempted}'. Valid values are: auto, always, never")]
pub struct ColorChoiceParseError {
    attempted: String,
}

#[derive(Debug, Parser)]
pub enum Subcommand {
    Serve(ServeCommand),
    Build(BuildCommand),
    Push(PushCommand),
    Pack(PackCommand),
}

impl Subcommand {
    pub fn command_name(&self) -> &'static str {
        match self {
            Subcommand::Serve(_) => "serve",
            Subcommand::Build(_) => "build",
            Subcommand::Push(_) => "push",
            Subcommand::Pack(_) => "pack",
        }
    }
}
