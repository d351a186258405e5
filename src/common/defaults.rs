//! Default socket addresses, periods and wire constants
//!
//! Workers default to loopback TCP ports; every address is overridable
//! from the command line.

/// Digitizer data stream the transformers subscribe to
pub const ABCD_DATA_ADDRESS: &str = "tcp://127.0.0.1:16181";

/// waps sockets
pub const WAPS_STATUS_ADDRESS: &str = "tcp://127.0.0.1:16187";
pub const WAPS_DATA_ADDRESS: &str = "tcp://127.0.0.1:16188";
pub const WAPS_COMMANDS_ADDRESS: &str = "tcp://127.0.0.1:16189";

/// waph sockets
pub const WAPH_STATUS_ADDRESS: &str = "tcp://127.0.0.1:16190";
pub const WAPH_DATA_ADDRESS: &str = "tcp://127.0.0.1:16191";
pub const WAPH_COMMANDS_ADDRESS: &str = "tcp://127.0.0.1:16192";

/// Base period of the state-machine loop, in milliseconds
pub const BASE_PERIOD_MS: u64 = 100;

/// Minimum interval between status publications, in seconds
pub const PUBLISH_PERIOD_SECS: u64 = 3;

/// Wait after binding, to sidestep the pub/sub slow-joiner race (ms)
pub const SLOW_JOINER_WAIT_MS: u64 = 1000;

/// Left shift applied to timestamps so the CFD fine timestamp fits in the
/// low bits as a fixed-point fraction
pub const FIXED_POINT_FRACTIONAL_BITS: u32 = 10;

/// Sizing factor for the forwarded-waveforms output buffer, relative to
/// the input message size
pub const WAVEFORMS_BUFFER_MULTIPLIER: usize = 2;

/// Emulator defaults
pub const EMULATOR_DATA_ADDRESS: &str = "tcp://127.0.0.1:16181";
pub const EMULATOR_PERIOD_MS: u64 = 500;
