//! CLI argument parsing for the pipeline binaries
//!
//! One clap derive struct per binary. Short flags follow the historical
//! worker interfaces; socket addresses default to loopback TCP ports.

use clap::Parser;

use super::defaults;

/// Arguments for the pulse-shape transformer (waps)
#[derive(Parser, Debug, Clone)]
#[command(name = "waps", about = "Waveform transformer computing pulse-shape features")]
pub struct WapsArgs {
    /// SUB socket address for waveform input
    #[arg(short = 'S', default_value = defaults::ABCD_DATA_ADDRESS)]
    pub subscribe_address: String,

    /// PUB socket address for event output
    #[arg(short = 'P', default_value = defaults::WAPS_DATA_ADDRESS)]
    pub publish_address: String,

    /// PUB socket address for status messages
    #[arg(long = "status", default_value = defaults::WAPS_STATUS_ADDRESS)]
    pub status_address: String,

    /// PULL socket address for commands
    #[arg(long = "commands", default_value = defaults::WAPS_COMMANDS_ADDRESS)]
    pub commands_address: String,

    /// Base period of the state machine loop, in milliseconds
    #[arg(short = 'T', default_value_t = defaults::BASE_PERIOD_MS)]
    pub base_period: u64,

    /// Enable waveforms forwarding
    #[arg(short = 'w')]
    pub forward_waveforms: bool,

    /// Enable synthetic gates in the forwarded waveforms
    #[arg(short = 'g')]
    pub enable_gates: bool,

    /// Disable the timestamp left shift that makes room for the fine timestamp
    #[arg(short = 'b')]
    pub disable_shift: bool,

    /// Load a user supplied library to select events
    #[arg(short = 'l', value_name = "LIBRARY")]
    pub selection_library: Option<String>,

    /// Replace the baseline slot with the signal variance, scaled by this factor
    #[arg(short = 'E', value_name = "FACTOR")]
    pub variance_multiplier: Option<f64>,

    /// Verbose execution
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Verbose execution with more output
    #[arg(short = 'V')]
    pub very_verbose: bool,

    /// Path to the JSON configuration file
    pub config_file: String,
}

/// Arguments for the pulse-height transformer (waph)
#[derive(Parser, Debug, Clone)]
#[command(name = "waph", about = "Waveform transformer computing pulse heights")]
pub struct WaphArgs {
    /// SUB socket address for waveform input
    #[arg(short = 'S', default_value = defaults::ABCD_DATA_ADDRESS)]
    pub subscribe_address: String,

    /// PUB socket address for event output
    #[arg(short = 'P', default_value = defaults::WAPH_DATA_ADDRESS)]
    pub publish_address: String,

    /// PUB socket address for status messages
    #[arg(long = "status", default_value = defaults::WAPH_STATUS_ADDRESS)]
    pub status_address: String,

    /// PULL socket address for commands
    #[arg(long = "commands", default_value = defaults::WAPH_COMMANDS_ADDRESS)]
    pub commands_address: String,

    /// Base period of the state machine loop, in milliseconds
    #[arg(short = 'T', default_value_t = defaults::BASE_PERIOD_MS)]
    pub base_period: u64,

    /// Enable waveforms forwarding
    #[arg(short = 'w')]
    pub forward_waveforms: bool,

    /// Enable synthetic gates in the forwarded waveforms
    #[arg(short = 'g')]
    pub enable_gates: bool,

    /// Verbose execution
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Verbose execution with more output
    #[arg(short = 'V')]
    pub very_verbose: bool,

    /// Path to the JSON configuration file
    pub config_file: String,
}

/// Arguments for the waveform emulator (wemu)
#[derive(Parser, Debug, Clone)]
#[command(name = "wemu", about = "Synthetic waveform source for pipeline testing")]
pub struct WemuArgs {
    /// PUB socket address for waveform output
    #[arg(short = 'P', default_value = defaults::EMULATOR_DATA_ADDRESS)]
    pub publish_address: String,

    /// Period between messages, in milliseconds
    #[arg(short = 'T', default_value_t = defaults::EMULATOR_PERIOD_MS)]
    pub period: u64,

    /// Waveforms per message
    #[arg(short = 'n', default_value_t = 16)]
    pub waveforms_per_message: usize,

    /// Samples per waveform
    #[arg(short = 's', default_value_t = 128)]
    pub samples_number: u32,

    /// Number of emulated channels
    #[arg(short = 'c', default_value_t = 2)]
    pub channels_number: u8,

    /// Verbose execution
    #[arg(short = 'v')]
    pub verbose: bool,
}

/// Map the two verbosity flags onto a tracing filter directive.
pub fn verbosity_directive(verbose: bool, very_verbose: bool) -> &'static str {
    if very_verbose {
        "abcd_rs=trace"
    } else if verbose {
        "abcd_rs=debug"
    } else {
        "abcd_rs=info"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waps_args_defaults() {
        let args = WapsArgs::try_parse_from(["waps", "config.json"]).unwrap();
        assert_eq!(args.subscribe_address, defaults::ABCD_DATA_ADDRESS);
        assert_eq!(args.publish_address, defaults::WAPS_DATA_ADDRESS);
        assert_eq!(args.base_period, defaults::BASE_PERIOD_MS);
        assert!(!args.forward_waveforms);
        assert!(!args.enable_gates);
        assert!(!args.disable_shift);
        assert_eq!(args.selection_library, None);
        assert_eq!(args.variance_multiplier, None);
        assert_eq!(args.config_file, "config.json");
    }

    #[test]
    fn waps_args_requires_config() {
        assert!(WapsArgs::try_parse_from(["waps"]).is_err());
    }

    #[test]
    fn waps_args_full() {
        let args = WapsArgs::try_parse_from([
            "waps",
            "-S",
            "tcp://127.0.0.1:7777",
            "-P",
            "tcp://127.0.0.1:7778",
            "-T",
            "50",
            "-w",
            "-g",
            "-b",
            "-l",
            "libselect.so",
            "-E",
            "2.5",
            "-V",
            "my_config.json",
        ])
        .unwrap();
        assert_eq!(args.subscribe_address, "tcp://127.0.0.1:7777");
        assert_eq!(args.publish_address, "tcp://127.0.0.1:7778");
        assert_eq!(args.base_period, 50);
        assert!(args.forward_waveforms);
        assert!(args.enable_gates);
        assert!(args.disable_shift);
        assert_eq!(args.selection_library, Some("libselect.so".to_string()));
        assert_eq!(args.variance_multiplier, Some(2.5));
        assert!(args.very_verbose);
        assert_eq!(args.config_file, "my_config.json");
    }

    #[test]
    fn waph_args_defaults() {
        let args = WaphArgs::try_parse_from(["waph", "config.json"]).unwrap();
        assert_eq!(args.publish_address, defaults::WAPH_DATA_ADDRESS);
        assert!(!args.forward_waveforms);
        assert_eq!(args.config_file, "config.json");
    }

    #[test]
    fn wemu_args_defaults() {
        let args = WemuArgs::try_parse_from(["wemu"]).unwrap();
        assert_eq!(args.publish_address, defaults::EMULATOR_DATA_ADDRESS);
        assert_eq!(args.waveforms_per_message, 16);
        assert_eq!(args.samples_number, 128);
        assert_eq!(args.channels_number, 2);
    }

    #[test]
    fn verbosity_mapping() {
        assert_eq!(verbosity_directive(false, false), "abcd_rs=info");
        assert_eq!(verbosity_directive(true, false), "abcd_rs=debug");
        assert_eq!(verbosity_directive(true, true), "abcd_rs=trace");
    }
}
