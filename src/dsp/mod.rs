//! DSP primitives for the waveform transformers
//!
//! Pure, deterministic, out-of-place filters over sample slices. Each
//! function takes a read-only input and writes a caller-allocated output
//! of equal length, so the hot path can reuse scratch buffers across
//! events. Boundary policy is uniform: indices before the array clamp to
//! the first sample, indices after the array clamp to the last.

mod cfd;
mod integrals;
mod shaping;

pub use cfd::{cfd_monitor, find_fine_zero_crossing, find_zero_crossing};
pub use integrals::{
    cumulative_sum, find_extrema, integral_baseline_subtract, running_mean, signal_variance,
    Extrema,
};
pub use shaping::{pole_zero_correction, trapezoidal_filter};
