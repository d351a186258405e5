//! wemu binary - synthetic waveform source for pipeline testing
//!
//! Usage:
//!   wemu [-P tcp://127.0.0.1:16181] [-T 500] [-n 16] [-s 128] [-c 2]

use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use abcd_rs::common::cli::{verbosity_directive, WemuArgs};
use abcd_rs::emulator::{EmulatorConfig, WaveformEmulator};
use abcd_rs::fsm;

fn main() -> Result<()> {
    let args = WemuArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(verbosity_directive(args.verbose, false).parse()?),
        )
        .init();

    let config = EmulatorConfig {
        address: args.publish_address,
        period: Duration::from_millis(args.period),
        waveforms_per_message: args.waveforms_per_message,
        samples_number: args.samples_number,
        channels_number: args.channels_number,
    };

    let terminate = fsm::register_terminate_flag()?;
    let mut emulator = WaveformEmulator::new(config);
    emulator.run(&terminate)?;
    Ok(())
}
