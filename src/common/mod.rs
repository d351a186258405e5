//! Types and helpers shared across the pipeline workers

pub mod cli;
pub mod defaults;
pub mod error;
pub mod status;

pub use error::{PipelineError, PipelineResult};
pub use status::StatusReporter;

use serde::Deserialize;

/// Pulse polarity of a detector channel.
///
/// For negative pulses the DSP operates on the reflected signal
/// `i16::MAX - sample`, so both polarities share the same filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Positive,
    Negative,
}

impl<'de> Deserialize<'de> for Polarity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let lower = text.to_lowercase();
        // Substring match, negative first, as the configuration files in the
        // wild carry values like "Negative pulses".
        if lower.contains("negative") {
            Ok(Polarity::Negative)
        } else if lower.contains("positive") {
            Ok(Polarity::Positive)
        } else {
            Err(serde::de::Error::custom(format!(
                "invalid pulse polarity: {} (should contain 'negative' or 'positive')",
                text
            )))
        }
    }
}
