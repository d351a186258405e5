//! Pulse shaping filters
//!
//! Pole-zero correction undoes the exponential decay of a charge
//! sensitive preamplifier; the trapezoidal filter turns the corrected
//! step into a trapezoid whose height measures the pulse amplitude.

use crate::common::Polarity;

/// Reflection applied to negative pulses so both polarities share filters
const REFLECTION: f64 = i16::MAX as f64;

/// Pole-zero correction: `y[n] = y[n−1] + (x[n] − f·x[n−1])` with
/// `f = exp(−1/decay_time)`.
///
/// For negative polarity the input is reflected to `i16::MAX − x`.
/// Indices before the array clamp to the first sample.
pub fn pole_zero_correction(
    samples: &[u16],
    decay_time: u32,
    polarity: Polarity,
    out: &mut [f64],
) {
    debug_assert_eq!(samples.len(), out.len());

    let factor = (-1.0 / decay_time as f64).exp();
    let value = |n: usize| -> f64 {
        match polarity {
            Polarity::Positive => samples[n] as f64,
            Polarity::Negative => REFLECTION - samples[n] as f64,
        }
    };

    let mut previous = 0.0;
    for n in 0..samples.len() {
        let x_n = value(n);
        let x_n_minus_one = value(n.saturating_sub(1));
        previous += x_n - x_n_minus_one * factor;
        out[n] = previous;
    }
}

/// Trapezoidal filter with `k = risetime` and `l = risetime + flattop`:
/// `y[n] = y[n−1] + (x[n] − x[n−k]) − (x[n−l] − x[n−k−l])`.
///
/// Negative polarity negates the input-difference terms. Indices before
/// the array clamp to the first sample.
pub fn trapezoidal_filter(
    samples: &[f64],
    risetime: u32,
    flattop: u32,
    polarity: Polarity,
    out: &mut [f64],
) {
    debug_assert_eq!(samples.len(), out.len());

    let k = risetime as usize;
    let l = (risetime + flattop) as usize;
    let clamped = |n: usize, delay: usize| samples[n.saturating_sub(delay)];

    let mut previous = 0.0;
    for n in 0..samples.len() {
        let difference = (samples[n] - clamped(n, k)) - (clamped(n, l) - clamped(n, k + l));
        previous += match polarity {
            Polarity::Positive => difference,
            Polarity::Negative => -difference,
        };
        out[n] = previous;
    }
}
