//! waph binary - waveform to pulse-height event transformer
//!
//! Usage:
//!   waph [options] <config_file>
//!   waph -S tcp://127.0.0.1:16181 -P tcp://127.0.0.1:16191 config.json

use anyhow::Result;
use clap::Parser;

use abcd_rs::common::cli::{verbosity_directive, WaphArgs};
use abcd_rs::fsm;
use abcd_rs::waph::{self, Settings, Status};

fn main() -> Result<()> {
    let args = WaphArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(verbosity_directive(args.verbose, args.very_verbose).parse()?),
        )
        .init();

    let terminate = fsm::register_terminate_flag()?;
    let mut status = Status::new(Settings::from(&args));
    let exit_code = waph::run(&mut status, &terminate);

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
