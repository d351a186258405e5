//! ABCD-RS: waveform-to-event DSP pipeline for digitizer acquisition
//!
//! Independent workers exchange framed binary messages over broker-less
//! ZeroMQ pub/sub. Each worker is a single-threaded deterministic state
//! machine. This crate provides the two waveform transformers (`waps` for
//! pulse-shape features, `waph` for pulse heights), the shared frame
//! codec, the DSP primitives and the selection plug-in interface.

pub mod channels;
pub mod common;
pub mod dsp;
pub mod emulator;
pub mod fsm;
pub mod plugin;
pub mod protocol;
pub mod transport;
pub mod waph;
pub mod waps;
