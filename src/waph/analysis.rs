//! The waveform→event hot path of the pulse-height transformer
//!
//! For every decoded frame: compensate the preamplifier decay with the
//! pole-zero correction, shape the step with the trapezoidal filter,
//! sample the plateau at the peaking time, subtract the leading baseline
//! of the shaped signal and rescale into the 16-bit feature range.

use tracing::{debug, trace, warn};

use crate::channels::{ChannelMap, PhaChannelParameters};
use crate::common::defaults::WAVEFORMS_BUFFER_MULTIPLIER;
use crate::dsp;
use crate::protocol::{
    self, EventPsd, WaveformFrame, WaveformHeader, EVENT_SIZE, WAVEFORM_HEADER_SIZE,
};

/// Gate lanes written when forwarding with synthetic gates
const FORWARD_GATES_NUMBER: u8 = 2;

/// Processing switches taken from the command line
#[derive(Debug, Clone, Default)]
pub struct ProcessingOptions {
    pub forward_waveforms: bool,
    pub enable_gates: bool,
}

/// Scratch buffers reused across events; resized once per waveform.
#[derive(Debug, Default)]
pub struct Scratch {
    samples: Vec<u16>,
    compensated: Vec<f64>,
    filtered: Vec<f64>,
    lane_compensated: Vec<u8>,
    lane_filtered: Vec<u8>,
}

impl Scratch {
    fn prepare(&mut self, samples_number: usize) {
        self.compensated.resize(samples_number, 0.0);
        self.filtered.resize(samples_number, 0.0);
    }
}

/// Hot-path counters, echoed in the status heartbeat
#[derive(Debug, Default, Clone)]
pub struct Statistics {
    pub messages_counter: u64,
    pub events_counter: u64,
    pub emitted_counter: u64,
    pub inactive_counter: u64,
    pub skipped_counter: u64,
}

/// Clamp a rescaled height into the 16-bit feature range, truncating the
/// fractional part as the digitizer firmware does.
fn clamp_height(value: f64) -> u16 {
    if value > u16::MAX as f64 {
        u16::MAX
    } else if value < 0.0 {
        0
    } else {
        value as u16
    }
}

/// Process one waveform message and return the encoded event payload and
/// (when forwarding with gates) the re-emitted waveform payload.
pub fn process_message(
    payload: &[u8],
    channels: &ChannelMap<PhaChannelParameters>,
    options: &ProcessingOptions,
    scratch: &mut Scratch,
    statistics: &mut Statistics,
) -> (Vec<u8>, Vec<u8>) {
    let mut events_out: Vec<u8> = Vec::with_capacity(payload.len());
    let waveforms_capacity = payload.len() * WAVEFORMS_BUFFER_MULTIPLIER;
    let mut waveforms_out: Vec<u8> = if options.forward_waveforms && options.enable_gates {
        Vec::with_capacity(waveforms_capacity)
    } else {
        Vec::new()
    };

    let mut offset = 0usize;
    while offset + WAVEFORM_HEADER_SIZE <= payload.len() {
        if events_out.len() + EVENT_SIZE > payload.len() {
            warn!("event output buffer full, dropping the remaining frames");
            break;
        }

        let (frame, next_offset) = match WaveformFrame::decode(payload, offset) {
            Ok(decoded) => decoded,
            Err(error) => {
                debug!(%error, offset, "dropping truncated tail of waveform message");
                break;
            }
        };
        offset = next_offset;
        statistics.events_counter += 1;

        let channel = frame.header.channel;
        let Some(parameters) = channels.get(channel) else {
            warn!(channel, "channel is not active");
            statistics.inactive_counter += 1;
            continue;
        };

        let samples_number = frame.header.samples_number as usize;
        if parameters.peaking_time as usize >= samples_number {
            warn!(channel, "peaking time is bigger than the samples number");
            statistics.skipped_counter += 1;
            continue;
        }
        if parameters.baseline_window as usize >= samples_number {
            warn!(channel, "baseline window is bigger than the samples number");
            statistics.skipped_counter += 1;
            continue;
        }

        frame.read_samples_into(&mut scratch.samples);
        scratch.prepare(samples_number);

        dsp::pole_zero_correction(
            &scratch.samples,
            parameters.decay_time,
            parameters.pulse_polarity,
            &mut scratch.compensated,
        );
        dsp::trapezoidal_filter(
            &scratch.compensated,
            parameters.trapezoid_risetime,
            parameters.trapezoid_flattop,
            parameters.pulse_polarity,
            &mut scratch.filtered,
        );

        let Some(trapezoid) = dsp::find_extrema(&scratch.filtered, 0, samples_number) else {
            statistics.skipped_counter += 1;
            continue;
        };

        let baseline_window = parameters.baseline_window as usize;
        let baseline_value: f64 = scratch.filtered[..baseline_window].iter().sum();

        let peak_height = scratch.filtered[parameters.peaking_time as usize] - baseline_value;
        let trapezoid_height = trapezoid.maximum - baseline_value;

        let rescaling = (1u32 << parameters.trapezoid_rescaling) as f64;
        let int_trapezoid_height = clamp_height(trapezoid_height / rescaling);
        let int_peak_height = clamp_height(peak_height / rescaling);

        let int_baseline = if baseline_window == 0 {
            scratch.filtered[0].round() as i16 as u16
        } else {
            baseline_value.round() as i16 as u16
        };

        let event = EventPsd {
            timestamp: frame.header.timestamp,
            qshort: int_trapezoid_height,
            qlong: int_peak_height,
            baseline: int_baseline,
            channel,
            flags: 0,
        };

        trace!(
            channel,
            timestamp = frame.header.timestamp,
            trapezoid_height,
            peak_height,
            baseline = baseline_value,
            "event computed"
        );

        events_out.extend_from_slice(&event.to_bytes());
        statistics.emitted_counter += 1;

        if options.forward_waveforms && options.enable_gates {
            forward_with_gates(
                &mut waveforms_out,
                waveforms_capacity,
                &frame,
                trapezoid.minimum,
                trapezoid_height,
                scratch,
            );
        }
    }

    statistics.messages_counter += 1;
    debug!(
        events = statistics.events_counter,
        emitted = statistics.emitted_counter,
        "message processed"
    );

    (events_out, waveforms_out)
}

/// Re-emit the waveform with two synthetic lanes: the compensated curve
/// and the trapezoid, both normalized to the `i8` dynamic range.
fn forward_with_gates(
    out: &mut Vec<u8>,
    capacity: usize,
    frame: &WaveformFrame<'_>,
    trapezoid_base: f64,
    trapezoid_height: f64,
    scratch: &mut Scratch,
) {
    let samples_number = frame.header.samples_number as usize;
    let header = WaveformHeader {
        timestamp: frame.header.timestamp,
        channel: frame.header.channel,
        samples_number: frame.header.samples_number,
        gates_number: FORWARD_GATES_NUMBER,
    };

    if out.len() + header.frame_size() > capacity {
        warn!("waveforms output buffer full, not forwarding");
        return;
    }

    let Some(pulse) = dsp::find_extrema(&scratch.compensated, 0, samples_number) else {
        return;
    };

    scratch.lane_compensated.resize(samples_number, 0);
    scratch.lane_filtered.resize(samples_number, 0);

    for i in 0..samples_number {
        scratch.lane_compensated[i] = ((scratch.compensated[i] - pulse.minimum)
            / pulse.maximum
            * i8::MAX as f64) as u8;
        scratch.lane_filtered[i] =
            ((scratch.filtered[i] - trapezoid_base) / trapezoid_height * i8::MAX as f64) as u8;
    }

    let mut gates = Vec::with_capacity(2 * samples_number);
    gates.extend_from_slice(&scratch.lane_compensated);
    gates.extend_from_slice(&scratch.lane_filtered);
    protocol::encode_waveform_into(out, &header, frame.samples, &gates);
}
