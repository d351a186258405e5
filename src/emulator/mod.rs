//! Synthetic waveform source
//!
//! Publishes waveform messages shaped like real digitizer traffic so the
//! transformers can be exercised without hardware: exponential-decay
//! pulses with Gaussian amplitude spread on a noisy baseline, several
//! frames per message spread over the configured channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::{debug, info};

use crate::common::defaults;
use crate::common::PipelineResult;
use crate::protocol;
use crate::transport;

/// Baseline level of the generated traces, in ADC counts
const BASELINE: f64 = 1000.0;
/// Baseline noise sigma
const NOISE_SIGMA: f64 = 4.0;
/// Mean pulse amplitude and its spread
const AMPLITUDE_MEAN: f64 = 3000.0;
const AMPLITUDE_SIGMA: f64 = 300.0;
/// Pulse decay constant, in samples
const DECAY_TIME: f64 = 25.0;

/// Emulator configuration
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// PUB socket address for waveform output
    pub address: String,
    /// Period between messages, in milliseconds
    pub period: Duration,
    /// Waveforms per message
    pub waveforms_per_message: usize,
    /// Samples per waveform
    pub samples_number: u32,
    /// Channels the frames are spread over
    pub channels_number: u8,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            address: defaults::EMULATOR_DATA_ADDRESS.to_string(),
            period: Duration::from_millis(defaults::EMULATOR_PERIOD_MS),
            waveforms_per_message: 16,
            samples_number: 128,
            channels_number: 2,
        }
    }
}

/// Waveform generator and publisher
pub struct WaveformEmulator {
    config: EmulatorConfig,
    timestamp: u64,
    messages_counter: u64,
}

impl WaveformEmulator {
    pub fn new(config: EmulatorConfig) -> Self {
        Self {
            config,
            timestamp: 0,
            messages_counter: 0,
        }
    }

    /// Build one message of concatenated waveform frames.
    pub fn generate_message(&mut self) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let noise = Normal::new(BASELINE, NOISE_SIGMA).unwrap();
        let amplitude = Normal::new(AMPLITUDE_MEAN, AMPLITUDE_SIGMA).unwrap();

        let samples_number = self.config.samples_number as usize;
        let pulse_start = samples_number / 4;

        let mut payload = Vec::new();
        let mut samples = vec![0u16; samples_number];

        for _ in 0..self.config.waveforms_per_message {
            let channel = rng.gen_range(0..self.config.channels_number);
            let pulse_amplitude: f64 = amplitude.sample(&mut rng);

            for (i, sample) in samples.iter_mut().enumerate() {
                let mut level: f64 = noise.sample(&mut rng);
                if i >= pulse_start {
                    let t = (i - pulse_start) as f64;
                    level += pulse_amplitude * (-t / DECAY_TIME).exp();
                }
                *sample = level.clamp(0.0, u16::MAX as f64) as u16;
            }

            self.timestamp += rng.gen_range(100..10_000);
            protocol::encode_waveform_samples_into(
                &mut payload,
                self.timestamp,
                channel,
                &samples,
                &[],
            );
        }

        payload
    }

    /// Publish messages at the configured period until terminated.
    pub fn run(&mut self, terminate: &AtomicBool) -> PipelineResult<()> {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::PUB)?;
        socket.bind(&self.config.address)?;
        info!(address = %self.config.address, "emulator publishing waveforms");

        thread::sleep(Duration::from_millis(defaults::SLOW_JOINER_WAIT_MS));

        while !terminate.swap(false, Ordering::Relaxed) {
            let payload = self.generate_message();
            let topic = protocol::waveforms_data_topic(payload.len());
            transport::send_message(&socket, &topic, &payload)?;
            self.messages_counter += 1;
            debug!(topic, messages = self.messages_counter, "message published");

            thread::sleep(self.config.period);
        }

        info!(messages = self.messages_counter, "emulator stopped");
        Ok(())
    }
}
