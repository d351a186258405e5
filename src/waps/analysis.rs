//! The waveform→event hot path of the pulse-shape transformer
//!
//! For every decoded frame: look up the channel parameters, build the
//! baseline-subtracted integral curve, optionally refine the timestamp
//! with a constant-fraction discriminator, extract the gate charges,
//! scale them into 16-bit features and run the selection plug-in.

use tracing::{debug, trace, warn};

use crate::channels::{ChannelMap, PsdChannelParameters};
use crate::common::defaults::{FIXED_POINT_FRACTIONAL_BITS, WAVEFORMS_BUFFER_MULTIPLIER};
use crate::common::Polarity;
use crate::dsp;
use crate::plugin::SelectionPlugin;
use crate::protocol::{
    self, EventPsd, WaveformFrame, WaveformHeader, EVENT_SIZE, WAVEFORM_HEADER_SIZE,
};

/// Gate lanes written when forwarding with synthetic gates
const FORWARD_GATES_NUMBER: u8 = 3;

/// Processing switches taken from the command line
#[derive(Debug, Clone, Default)]
pub struct ProcessingOptions {
    pub forward_waveforms: bool,
    pub enable_gates: bool,
    pub disable_shift: bool,
    /// Replace the baseline slot with `round(variance · multiplier)`
    pub variance_multiplier: Option<f64>,
}

/// Scratch buffers reused across events; resized once per waveform.
#[derive(Debug, Default)]
pub struct Scratch {
    samples: Vec<u16>,
    integral: Vec<u64>,
    curve: Vec<f64>,
    smooth: Vec<f64>,
    monitor: Vec<f64>,
    lane_short: Vec<u8>,
    lane_long: Vec<u8>,
    lane_monitor: Vec<u8>,
}

impl Scratch {
    fn prepare(&mut self, samples_number: usize) {
        self.integral.resize(samples_number, 0);
        self.curve.resize(samples_number, 0.0);
        self.smooth.resize(samples_number, 0.0);
        self.monitor.resize(samples_number, 0.0);
    }
}

/// Hot-path counters, echoed in the status heartbeat
#[derive(Debug, Default, Clone)]
pub struct Statistics {
    /// Waveform messages processed
    pub messages_counter: u64,
    /// Waveform frames seen
    pub events_counter: u64,
    /// Events accepted by the selection plug-in
    pub selected_counter: u64,
    /// Frames skipped for an inactive channel
    pub inactive_counter: u64,
    /// Frames skipped for an out-of-range integration window
    pub skipped_counter: u64,
}

/// Everything the plug-in call needs besides the record itself
struct EventFeatures {
    timestamp: u64,
    baseline_end: usize,
    baseline: f64,
    scaled_qshort: f64,
    scaled_qlong: f64,
    monitor_minimum: f64,
    monitor_maximum: f64,
    cfd_ran: bool,
    event: EventPsd,
}

/// Process one waveform message and return the encoded event payload and
/// (when forwarding) the re-emitted waveform payload.
pub fn process_message(
    payload: &[u8],
    channels: &ChannelMap<PsdChannelParameters>,
    options: &ProcessingOptions,
    plugin: &mut SelectionPlugin,
    scratch: &mut Scratch,
    statistics: &mut Statistics,
) -> (Vec<u8>, Vec<u8>) {
    let mut events_out: Vec<u8> = Vec::with_capacity(payload.len());
    let waveforms_capacity = payload.len() * WAVEFORMS_BUFFER_MULTIPLIER;
    let mut waveforms_out: Vec<u8> = if options.forward_waveforms {
        Vec::with_capacity(waveforms_capacity)
    } else {
        Vec::new()
    };

    let mut offset = 0usize;
    while offset + WAVEFORM_HEADER_SIZE <= payload.len() {
        // The feature records are a reduction of the waveform data, so the
        // output payload is bounded by the input payload.
        if events_out.len() + EVENT_SIZE > payload.len() {
            warn!("event output buffer full, dropping the remaining frames");
            break;
        }

        let (frame, next_offset) = match WaveformFrame::decode(payload, offset) {
            Ok(decoded) => decoded,
            Err(error) => {
                // Truncated trailing bytes are dropped without touching the
                // frames already processed.
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
        if let Err(reason) = validate_gates(parameters, parameters.baseline_end(), samples_number)
        {
            warn!(channel, %reason, "skipping event");
            statistics.skipped_counter += 1;
            continue;
        }

        frame.read_samples_into(&mut scratch.samples);
        let features = compute_features(frame.header.timestamp, parameters, options, scratch);

        let mut event = features.event;
        event.channel = channel;
        let selected = plugin.select_event(
            &scratch.samples,
            features.baseline_end,
            features.timestamp,
            features.scaled_qshort,
            features.scaled_qlong,
            features.baseline,
            channel,
            event.has_pileup(),
            &mut event,
        );

        trace!(
            channel,
            timestamp = features.timestamp,
            qshort = { event.qshort },
            qlong = { event.qlong },
            baseline = { event.baseline },
            selected,
            "event computed"
        );

        if !selected {
            continue;
        }
        statistics.selected_counter += 1;
        events_out.extend_from_slice(&event.to_bytes());

        if options.forward_waveforms {
            forward_waveform(
                &mut waveforms_out,
                waveforms_capacity,
                &frame,
                &features,
                parameters,
                options,
                scratch,
            );
        }
    }

    statistics.messages_counter += 1;
    debug!(
        events = statistics.events_counter,
        selected = statistics.selected_counter,
        "message processed"
    );

    (events_out, waveforms_out)
}

/// Check that the baseline window and every integration gate stay inside
/// the sample array.
fn validate_gates(
    parameters: &PsdChannelParameters,
    baseline_end: usize,
    samples_number: usize,
) -> Result<(), String> {
    let n = samples_number as i64;
    let end = baseline_end as i64;

    if end < 1 || end > n {
        return Err(format!(
            "baseline width is too long ({} of {} samples)",
            end, n
        ));
    }
    if end + parameters.gate_short as i64 > n {
        return Err("short gate is too long".to_string());
    }
    if end + parameters.gate_long as i64 > n {
        return Err("long gate is too long".to_string());
    }
    if parameters.gate_extra != 0 {
        let extra_edge = end + parameters.gate_extra as i64;
        if extra_edge < 1 || extra_edge > n {
            return Err("extra gate is out of range".to_string());
        }
    }
    Ok(())
}

/// Charge of the gate `[baseline_end − 1, baseline_end + gate − 1]` on the
/// integral curve. The integral before the first sample is zero.
fn gate_charge(curve: &[f64], baseline_end: usize, gate: i64) -> f64 {
    let right = curve[(baseline_end as i64 + gate - 1) as usize];
    let left = if baseline_end >= 2 {
        curve[baseline_end - 2]
    } else {
        0.0
    };
    right - left
}

/// Scale an integer charge by `4^charge_sensitivity` and clamp it into the
/// 16-bit range of the wire format.
fn scale_charge(charge: i64, charge_sensitivity: u32) -> u16 {
    (charge >> (2 * charge_sensitivity)).clamp(0, u16::MAX as i64) as u16
}

fn compute_features(
    raw_timestamp: u64,
    parameters: &PsdChannelParameters,
    options: &ProcessingOptions,
    scratch: &mut Scratch,
) -> EventFeatures {
    let samples_number = scratch.samples.len();
    scratch.prepare(samples_number);

    // The shift is applied to every event, so the stream never mixes
    // shifted and unshifted timestamps.
    let mut timestamp = if options.disable_shift {
        raw_timestamp
    } else {
        raw_timestamp << FIXED_POINT_FRACTIONAL_BITS
    };

    dsp::cumulative_sum(&scratch.samples, &mut scratch.integral);

    let mut baseline_end = parameters.baseline_end();
    let mut baseline = scratch.integral[baseline_end - 1] as f64 / baseline_end as f64;
    dsp::integral_baseline_subtract(&scratch.integral, baseline, &mut scratch.curve);

    let mut monitor_minimum = 0.0;
    let mut monitor_maximum = 0.0;
    let mut cfd_ran = false;

    if parameters.cfd.enabled {
        dsp::running_mean(
            &scratch.curve,
            parameters.cfd.smooth_samples,
            &mut scratch.smooth,
        );
        dsp::cfd_monitor(
            &scratch.smooth,
            parameters.cfd.delay,
            parameters.cfd.fraction,
            &mut scratch.monitor,
        );

        if let Some(extrema) = dsp::find_extrema(&scratch.monitor, 0, samples_number) {
            monitor_minimum = extrema.minimum;
            monitor_maximum = extrema.maximum;
            cfd_ran = true;

            let (left, right) = if extrema.index_min > extrema.index_max {
                (extrema.index_max, extrema.index_min)
            } else {
                (extrema.index_min, extrema.index_max)
            };

            if let Some(crossing) = dsp::find_zero_crossing(&scratch.monitor, left, right) {
                let fine = dsp::find_fine_zero_crossing(
                    &scratch.monitor,
                    crossing,
                    parameters.cfd.zero_crossing_samples,
                )
                .unwrap_or(0.0);

                let fine_timestamp =
                    (fine * (1u64 << FIXED_POINT_FRACTIONAL_BITS) as f64).floor() as u64;
                timestamp = timestamp.wrapping_add(fine_timestamp);

                // Re-anchor the gates on the measured arrival time; the old
                // window is kept when the new one leaves the array.
                let new_baseline_end = crossing as i64 - parameters.pregate as i64;
                if new_baseline_end > 0
                    && (new_baseline_end as usize) < samples_number
                    && validate_gates(parameters, new_baseline_end as usize, samples_number)
                        .is_ok()
                {
                    baseline_end = new_baseline_end as usize;
                    baseline =
                        scratch.integral[baseline_end - 1] as f64 / baseline_end as f64;
                } else {
                    debug!(
                        crossing,
                        new_baseline_end, "keeping previous baseline end after CFD"
                    );
                }

                trace!(
                    crossing,
                    fine,
                    fine_timestamp,
                    baseline_end,
                    "CFD calculation done"
                );
            }
        }
    }

    let mut qshort = gate_charge(&scratch.curve, baseline_end, parameters.gate_short as i64);
    let mut qlong = gate_charge(&scratch.curve, baseline_end, parameters.gate_long as i64);
    let mut qextra = if parameters.gate_extra != 0 {
        gate_charge(&scratch.curve, baseline_end, parameters.gate_extra as i64)
    } else {
        0.0
    };

    if parameters.pulse_polarity == Polarity::Negative {
        qshort = -qshort;
        qlong = -qlong;
        qextra = -qextra;
    }

    let int_qshort = scale_charge(qshort.round() as i64, parameters.charge_sensitivity);
    let int_qlong = scale_charge(qlong.round() as i64, parameters.charge_sensitivity);
    let int_qextra =
        ((qextra.round() as i64) >> (2 * parameters.charge_sensitivity)) as i16;

    let divisor = 4f64.powi(parameters.charge_sensitivity as i32);
    let scaled_qshort = qshort / divisor;
    let scaled_qlong = qlong / divisor;

    let mut int_baseline = baseline.round() as u16;
    if let Some(multiplier) = options.variance_multiplier {
        // Baseline-window variance, emitted in place of the baseline for
        // effective-number-of-bits studies.
        if let Some(variance) = dsp::signal_variance(&scratch.samples, baseline_end, baseline) {
            int_baseline = (variance * multiplier).round() as u16;
        }
    }

    let event = EventPsd {
        timestamp,
        qshort: int_qshort,
        qlong: int_qlong,
        baseline: if parameters.gate_extra == 0 {
            int_baseline
        } else {
            int_qextra as u16
        },
        channel: 0, // filled by the caller
        flags: 0,
    };

    EventFeatures {
        timestamp,
        baseline_end,
        baseline,
        scaled_qshort,
        scaled_qlong,
        monitor_minimum,
        monitor_maximum,
        cfd_ran,
        event,
    }
}

/// Re-emit the waveform, either untouched or with the three synthetic
/// gate lanes (short mask, long mask, normalized CFD monitor).
fn forward_waveform(
    out: &mut Vec<u8>,
    capacity: usize,
    frame: &WaveformFrame<'_>,
    features: &EventFeatures,
    parameters: &PsdChannelParameters,
    options: &ProcessingOptions,
    scratch: &mut Scratch,
) {
    let samples_number = frame.header.samples_number as usize;
    let header = WaveformHeader {
        timestamp: features.timestamp,
        channel: frame.header.channel,
        samples_number: frame.header.samples_number,
        gates_number: if options.enable_gates {
            FORWARD_GATES_NUMBER
        } else {
            frame.header.gates_number
        },
    };

    if out.len() + header.frame_size() > capacity {
        warn!("waveforms output buffer full, not forwarding");
        return;
    }

    if !options.enable_gates {
        protocol::encode_waveform_into(out, &header, frame.samples, frame.gates);
        return;
    }

    scratch.lane_short.resize(samples_number, 0);
    scratch.lane_long.resize(samples_number, 0);
    scratch.lane_monitor.resize(samples_number, 0);

    let baseline_end = features.baseline_end;
    let monitor_delta = features.monitor_maximum - features.monitor_minimum;

    for i in 0..samples_number {
        let in_short = baseline_end <= i && i < baseline_end + parameters.gate_short as usize;
        let in_long = baseline_end <= i && i < baseline_end + parameters.gate_long as usize;
        scratch.lane_short[i] = if in_short { u8::MAX } else { 0 };
        scratch.lane_long[i] = if in_long { u8::MAX } else { 0 };
        scratch.lane_monitor[i] = if features.cfd_ran {
            ((scratch.monitor[i] - features.monitor_minimum) / monitor_delta * u8::MAX as f64)
                as u8
        } else {
            0
        };
    }

    let mut gates = Vec::with_capacity(3 * samples_number);
    gates.extend_from_slice(&scratch.lane_short);
    gates.extend_from_slice(&scratch.lane_long);
    gates.extend_from_slice(&scratch.lane_monitor);
    protocol::encode_waveform_into(out, &header, frame.samples, &gates);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_events;
    use serde_json::json;
    use std::ffi::c_void;
    use std::ptr;

    fn psd_config(pretrigger: u32, pregate: u32, gate_short: u32, gate_long: u32) -> ChannelMap<PsdChannelParameters> {
        let config = json!({
            "channels": [{
                "id": 0,
                "enabled": true,
                "charge_sensitivity": 0,
                "pretrigger": pretrigger,
                "pregate": pregate,
                "short_gate": gate_short,
                "long_gate": gate_long,
                "pulse_polarity": "positive",
            }]
        });
        ChannelMap::from_config(&config).unwrap()
    }

    fn message_of(timestamp: u64, channel: u8, samples: &[u16]) -> Vec<u8> {
        let mut payload = Vec::new();
        protocol::encode_waveform_samples_into(&mut payload, timestamp, channel, samples, &[]);
        payload
    }

    fn run_simple(
        payload: &[u8],
        channels: &ChannelMap<PsdChannelParameters>,
        options: &ProcessingOptions,
    ) -> (Vec<EventPsd>, Vec<u8>, Statistics) {
        let mut plugin = SelectionPlugin::identity();
        let mut scratch = Scratch::default();
        let mut statistics = Statistics::default();
        let (events, waveforms) = process_message(
            payload,
            channels,
            options,
            &mut plugin,
            &mut scratch,
            &mut statistics,
        );
        (decode_events(&events), waveforms, statistics)
    }

    fn no_shift() -> ProcessingOptions {
        ProcessingOptions {
            disable_shift: true,
            ..Default::default()
        }
    }

    #[test]
    fn flat_signal_yields_zero_charges() {
        // All samples at the baseline: both gate charges vanish and the
        // baseline slot carries the level itself.
        let samples = [1000u16; 8];
        let channels = psd_config(54, 50, 2, 4);
        let payload = message_of(7, 0, &samples);

        let (events, _, statistics) = run_simple(&payload, &channels, &no_shift());
        assert_eq!(events.len(), 1);
        let event = events[0];
        assert_eq!({ event.qshort }, 0);
        assert_eq!({ event.qlong }, 0);
        assert_eq!({ event.baseline }, 1000);
        assert_eq!(event.flags, 0);
        assert_eq!({ event.timestamp }, 7);
        assert_eq!(statistics.selected_counter, 1);
    }

    #[test]
    fn impulse_charge_lands_in_both_gates() {
        // Impulse of 100 over a 1000 baseline at index 5; the gates start
        // at the right edge of the baseline window and catch it whole.
        let samples = [1000u16, 1000, 1000, 1000, 1000, 1100, 1000, 1000];
        let channels = psd_config(55, 50, 1, 3);
        let payload = message_of(0, 0, &samples);

        let (events, _, _) = run_simple(&payload, &channels, &no_shift());
        assert_eq!(events.len(), 1);
        assert_eq!({ events[0].qshort }, 100);
        assert_eq!({ events[0].qlong }, 100);
        assert_eq!({ events[0].baseline }, 1000);
    }

    #[test]
    fn negative_polarity_reflected_signal_gives_same_charges() {
        let positive = [1000u16, 1000, 1000, 1000, 1000, 1100, 1000, 1000];
        let reflected: Vec<u16> = positive.iter().map(|&x| i16::MAX as u16 - x).collect();

        let config = json!({
            "channels": [{
                "id": 0,
                "enabled": true,
                "charge_sensitivity": 0,
                "pretrigger": 55,
                "pregate": 50,
                "short_gate": 1,
                "long_gate": 3,
                "pulse_polarity": "negative",
            }]
        });
        let channels: ChannelMap<PsdChannelParameters> = ChannelMap::from_config(&config).unwrap();
        let payload = message_of(0, 0, &reflected);

        let (events, _, _) = run_simple(&payload, &channels, &no_shift());
        assert_eq!(events.len(), 1);
        assert_eq!({ events[0].qshort }, 100);
        assert_eq!({ events[0].qlong }, 100);
    }

    #[test]
    fn charge_sensitivity_divides_by_powers_of_four() {
        let mut samples = [1000u16; 16];
        samples[6] = 1000 + 6400;
        let config = json!({
            "channels": [{
                "id": 0,
                "enabled": true,
                "charge_sensitivity": 2,
                "pretrigger": 55,
                "pregate": 50,
                "short_gate": 4,
                "long_gate": 8,
                "pulse_polarity": "positive",
            }]
        });
        let channels: ChannelMap<PsdChannelParameters> = ChannelMap::from_config(&config).unwrap();
        let payload = message_of(0, 0, &samples);

        let (events, _, _) = run_simple(&payload, &channels, &no_shift());
        // 6400 >> (2·2) = 400
        assert_eq!({ events[0].qshort }, 400);
        assert_eq!({ events[0].qlong }, 400);
    }

    #[test]
    fn charges_clamp_into_u16_range() {
        // Saturating pulse: the raw charge exceeds 0xFFFF.
        let mut samples = [100u16; 64];
        for sample in samples.iter_mut().skip(8).take(40) {
            *sample = 60000;
        }
        let channels = psd_config(55, 50, 4, 40);
        let payload = message_of(0, 0, &samples);

        let (events, _, _) = run_simple(&payload, &channels, &no_shift());
        assert_eq!({ events[0].qlong }, u16::MAX);
        // A dip below the baseline clamps at zero instead of wrapping.
        let mut dipped = [1000u16; 16];
        dipped[5] = 0;
        let channels = psd_config(55, 50, 2, 4);
        let payload = message_of(0, 0, &dipped);
        let (events, _, _) = run_simple(&payload, &channels, &no_shift());
        assert_eq!({ events[0].qshort }, 0);
    }

    #[test]
    fn timestamp_is_left_shifted_unless_disabled() {
        let samples = [1000u16; 8];
        let channels = psd_config(54, 50, 2, 4);
        let payload = message_of(3, 0, &samples);

        let (events, _, _) = run_simple(&payload, &channels, &ProcessingOptions::default());
        assert_eq!({ events[0].timestamp }, 3 << FIXED_POINT_FRACTIONAL_BITS);

        let (events, _, _) = run_simple(&payload, &channels, &no_shift());
        assert_eq!({ events[0].timestamp }, 3);
    }

    #[test]
    fn inactive_channel_is_counted_and_skipped() {
        let samples = [1000u16; 8];
        let channels = psd_config(54, 50, 2, 4);
        let payload = message_of(0, 9, &samples);

        let (events, _, statistics) = run_simple(&payload, &channels, &no_shift());
        assert!(events.is_empty());
        assert_eq!(statistics.inactive_counter, 1);
        assert_eq!(statistics.selected_counter, 0);
    }

    #[test]
    fn out_of_range_window_skips_only_that_event() {
        // First frame: 4 samples cannot hold a baseline end of 4 plus the
        // long gate. Second frame: plenty of samples, processed fine.
        let short_samples = [1000u16; 4];
        let good_samples = [1000u16; 16];
        let channels = psd_config(54, 50, 2, 4);

        let mut payload = message_of(1, 0, &short_samples);
        payload.extend(message_of(2, 0, &good_samples));

        let (events, _, statistics) = run_simple(&payload, &channels, &no_shift());
        assert_eq!(events.len(), 1);
        assert_eq!({ events[0].timestamp }, 2);
        assert_eq!(statistics.skipped_counter, 1);
        assert_eq!(statistics.events_counter, 2);
    }

    #[test]
    fn variance_mode_replaces_baseline_slot() {
        let samples = [998u16, 1002, 999, 1001, 1000, 1000, 1000, 1000];
        let channels = psd_config(54, 50, 2, 4);
        let payload = message_of(0, 0, &samples);

        let options = ProcessingOptions {
            disable_shift: true,
            variance_multiplier: Some(3.0),
            ..Default::default()
        };
        let (events, _, _) = run_simple(&payload, &channels, &options);
        // Baseline window covers the first 4 samples: Σ(x−b)²/(n−1) = 10/3.
        assert_eq!({ events[0].baseline }, 10);
    }

    #[test]
    fn extra_gate_fills_the_baseline_slot() {
        let samples = [1000u16, 1000, 1000, 1000, 1000, 1100, 1000, 1000];
        let config = json!({
            "channels": [{
                "id": 0,
                "enabled": true,
                "charge_sensitivity": 0,
                "pretrigger": 55,
                "pregate": 50,
                "short_gate": 1,
                "long_gate": 3,
                "extra_gate": 2,
                "pulse_polarity": "positive",
            }]
        });
        let channels: ChannelMap<PsdChannelParameters> = ChannelMap::from_config(&config).unwrap();
        let payload = message_of(0, 0, &samples);

        let (events, _, _) = run_simple(&payload, &channels, &no_shift());
        // Extra gate of 2 covers the impulse: the slot holds the charge,
        // not the baseline.
        assert_eq!({ events[0].baseline }, 100);
    }

    /// Double-exponential test pulse: fast rise, slower decay.
    fn cfd_pulse() -> Vec<u16> {
        (0..64)
            .map(|i| {
                if i < 8 {
                    1000
                } else {
                    let t = (i - 8) as f64;
                    let shape = (-t / 4.0).exp() - (-t).exp();
                    1000 + (3000.0 * shape).round() as u16
                }
            })
            .collect()
    }

    #[test]
    fn cfd_adds_fine_timestamp_in_the_low_bits() {
        let samples = cfd_pulse();
        let config = json!({
            "channels": [{
                "id": 0,
                "enabled": true,
                "charge_sensitivity": 0,
                "pretrigger": 44,
                "pregate": 40,
                "short_gate": 6,
                "long_gate": 12,
                "pulse_polarity": "positive",
                "CFD": {
                    "enabled": true,
                    "smooth_samples": 3,
                    "fraction": 0.5,
                    "delay": 4,
                    "zero_crossing_samples": 5,
                },
            }]
        });
        let channels: ChannelMap<PsdChannelParameters> = ChannelMap::from_config(&config).unwrap();
        let payload = message_of(100, 0, &samples);

        // Expected fine timestamp, derived with the primitives directly.
        let n = samples.len();
        let mut integral = vec![0u64; n];
        dsp::cumulative_sum(&samples, &mut integral);
        let baseline = integral[3] as f64 / 4.0;
        let mut curve = vec![0f64; n];
        dsp::integral_baseline_subtract(&integral, baseline, &mut curve);
        let mut smooth = vec![0f64; n];
        dsp::running_mean(&curve, 3, &mut smooth);
        let mut monitor = vec![0f64; n];
        dsp::cfd_monitor(&smooth, 4, 0.5, &mut monitor);
        let extrema = dsp::find_extrema(&monitor, 0, n).unwrap();
        let (left, right) = if extrema.index_min > extrema.index_max {
            (extrema.index_max, extrema.index_min)
        } else {
            (extrema.index_min, extrema.index_max)
        };
        let crossing = dsp::find_zero_crossing(&monitor, left, right).unwrap();
        let fine = dsp::find_fine_zero_crossing(&monitor, crossing, 5).unwrap();
        let fine_timestamp =
            (fine * (1u64 << FIXED_POINT_FRACTIONAL_BITS) as f64).floor() as u64;
        // The discriminator must land after the pulse onset.
        assert!(fine > 8.0);
        assert!(fine_timestamp > 0);

        let (events, _, _) = run_simple(&payload, &channels, &ProcessingOptions::default());
        assert_eq!(events.len(), 1);
        let timestamp = { events[0].timestamp };
        // The crossing position (integer part in sample ticks, fractional
        // part in the low bits) is added to the shifted trigger timestamp.
        assert_eq!(timestamp, (100 << FIXED_POINT_FRACTIONAL_BITS) + fine_timestamp);
        assert_eq!(
            timestamp >> FIXED_POINT_FRACTIONAL_BITS,
            100 + fine.floor() as u64
        );
    }

    #[test]
    fn event_buffer_never_exceeds_input_size() {
        // Degenerate frames with zero samples: 14 input bytes each cannot
        // pay for 16 output bytes; the loop must stop early.
        let mut payload = Vec::new();
        for i in 0..4 {
            protocol::encode_waveform_samples_into(&mut payload, i, 0, &[], &[]);
        }
        let channels = psd_config(54, 50, 2, 4);

        let mut plugin = SelectionPlugin::identity();
        let mut scratch = Scratch::default();
        let mut statistics = Statistics::default();
        let (events, _) = process_message(
            &payload,
            &channels,
            &no_shift(),
            &mut plugin,
            &mut scratch,
            &mut statistics,
        );
        assert!(events.len() <= payload.len());
    }

    // -----------------------------------------------------------------------
    // Selection plug-in interaction
    // -----------------------------------------------------------------------

    unsafe extern "C" fn init_null() -> *mut c_void {
        ptr::null_mut()
    }

    unsafe extern "C" fn close_zero(_user_data: *mut c_void) -> i32 {
        0
    }

    unsafe extern "C" fn reject_channel_zero(
        _samples_number: u32,
        _samples: *const u16,
        _baseline_end: usize,
        _timestamp: u64,
        _qshort: f64,
        _qlong: f64,
        _baseline: f64,
        channel: u8,
        _pileup: u8,
        _event: *mut EventPsd,
        _user_data: *mut c_void,
    ) -> bool {
        channel != 0
    }

    #[test]
    fn plugin_predicate_filters_published_events() {
        let samples = [1000u16; 8];
        let config = json!({
            "channels": [
                {
                    "id": 0, "enabled": true, "charge_sensitivity": 0,
                    "pretrigger": 54, "pregate": 50, "short_gate": 2,
                    "long_gate": 4, "pulse_polarity": "positive",
                },
                {
                    "id": 1, "enabled": true, "charge_sensitivity": 0,
                    "pretrigger": 54, "pregate": 50, "short_gate": 2,
                    "long_gate": 4, "pulse_polarity": "positive",
                },
            ]
        });
        let channels: ChannelMap<PsdChannelParameters> = ChannelMap::from_config(&config).unwrap();

        let mut payload = Vec::new();
        for channel in [0u8, 1, 0, 1, 1] {
            protocol::encode_waveform_samples_into(&mut payload, 0, channel, &samples, &[]);
        }

        let mut plugin =
            SelectionPlugin::from_functions(init_null, reject_channel_zero, close_zero);
        let mut scratch = Scratch::default();
        let mut statistics = Statistics::default();
        let (events, _) = process_message(
            &payload,
            &channels,
            &no_shift(),
            &mut plugin,
            &mut scratch,
            &mut statistics,
        );

        let events = decode_events(&events);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|event| event.channel == 1));
        assert_eq!(statistics.events_counter, 5);
        assert_eq!(statistics.selected_counter, 3);
    }

    // -----------------------------------------------------------------------
    // Forwarding
    // -----------------------------------------------------------------------

    #[test]
    fn forwarding_reemits_waveform_with_updated_timestamp() {
        let samples = [1000u16; 8];
        let channels = psd_config(54, 50, 2, 4);
        let payload = message_of(21, 0, &samples);

        let options = ProcessingOptions {
            forward_waveforms: true,
            ..Default::default()
        };
        let (events, waveforms, _) = run_simple(&payload, &channels, &options);
        assert_eq!(events.len(), 1);

        let (frame, _) = WaveformFrame::decode(&waveforms, 0).unwrap();
        assert_eq!(
            frame.header.timestamp,
            21 << FIXED_POINT_FRACTIONAL_BITS
        );
        assert_eq!(frame.header.samples_number, 8);
        assert_eq!(frame.header.gates_number, 0);
        assert_eq!(frame.samples, &payload[14..14 + 16]);
    }

    #[test]
    fn forwarding_with_gates_writes_three_lanes() {
        let samples = [1000u16; 12];
        let channels = psd_config(54, 50, 3, 6);
        let payload = message_of(0, 0, &samples);

        let options = ProcessingOptions {
            forward_waveforms: true,
            enable_gates: true,
            disable_shift: true,
            ..Default::default()
        };
        let (_, waveforms, _) = run_simple(&payload, &channels, &options);

        let (frame, _) = WaveformFrame::decode(&waveforms, 0).unwrap();
        assert_eq!(frame.header.gates_number, 3);

        // Short mask: indices [4, 7); long mask: [4, 10); monitor all zero
        // because the CFD never ran.
        let short_lane = frame.gate_lane(0);
        let long_lane = frame.gate_lane(1);
        let monitor_lane = frame.gate_lane(2);
        assert_eq!(short_lane[3], 0);
        assert_eq!(short_lane[4], 255);
        assert_eq!(short_lane[6], 255);
        assert_eq!(short_lane[7], 0);
        assert_eq!(long_lane[9], 255);
        assert_eq!(long_lane[10], 0);
        assert!(monitor_lane.iter().all(|&value| value == 0));
    }
}
