//! waps binary - waveform to pulse-shape event transformer
//!
//! Usage:
//!   waps [options] <config_file>
//!   waps -S tcp://127.0.0.1:16181 -P tcp://127.0.0.1:16188 config.json

use anyhow::Result;
use clap::Parser;

use abcd_rs::common::cli::{verbosity_directive, WapsArgs};
use abcd_rs::fsm;
use abcd_rs::waps::{self, Settings, Status};

fn main() -> Result<()> {
    let args = WapsArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(verbosity_directive(args.verbose, args.very_verbose).parse()?),
        )
        .init();

    let terminate = fsm::register_terminate_flag()?;
    let mut status = Status::new(Settings::from(&args));
    let exit_code = waps::run(&mut status, &terminate);

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
