//! Per-channel DSP configuration
//!
//! Parameters are bound from the JSON `channels` array of the worker
//! configuration. Disabled entries are skipped; enabled entries missing a
//! required key abort the configuration, as does a duplicated enabled id.
//! Lookups scan a small fixed list, and the active table is only replaced
//! when a whole new table has been built successfully.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::common::{PipelineError, PipelineResult, Polarity};

/// Behaviour every per-channel parameter record implements
pub trait ChannelEntry: DeserializeOwned {
    fn id(&self) -> u8;

    /// Semantic checks beyond field presence
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// Clamp fields into their working ranges after deserialization
    fn normalize(&mut self) {}
}

/// Constant-fraction discriminator settings (optional per channel)
#[derive(Debug, Clone, Deserialize)]
pub struct CfdParameters {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_smooth_samples")]
    pub smooth_samples: u32,
    #[serde(default)]
    pub fraction: f64,
    #[serde(default)]
    pub delay: i32,
    #[serde(default)]
    pub zero_crossing_samples: u32,
}

fn default_smooth_samples() -> u32 {
    1
}

impl Default for CfdParameters {
    fn default() -> Self {
        Self {
            enabled: false,
            smooth_samples: 1,
            fraction: 0.0,
            delay: 0,
            zero_crossing_samples: 0,
        }
    }
}

/// Channel parameters for the pulse-shape transformer
#[derive(Debug, Clone, Deserialize)]
pub struct PsdChannelParameters {
    pub id: u8,
    pub enabled: bool,
    pub charge_sensitivity: u32,
    pub pretrigger: u32,
    pub pregate: u32,
    #[serde(rename = "short_gate")]
    pub gate_short: u32,
    #[serde(rename = "long_gate")]
    pub gate_long: u32,
    #[serde(rename = "extra_gate", default)]
    pub gate_extra: i32,
    pub pulse_polarity: Polarity,
    #[serde(default)]
    pub pileup_threshold: u32,
    #[serde(rename = "CFD", default)]
    pub cfd: CfdParameters,
}

impl PsdChannelParameters {
    /// First sample after the baseline window: `pretrigger − pregate`
    pub fn baseline_end(&self) -> usize {
        (self.pretrigger - self.pregate) as usize
    }
}

impl ChannelEntry for PsdChannelParameters {
    fn id(&self) -> u8 {
        self.id
    }

    fn validate(&self) -> Result<(), String> {
        if self.pretrigger <= self.pregate {
            return Err(format!(
                "pregate ({}) is bigger than pretrigger ({}) for channel: {}",
                self.pregate, self.pretrigger, self.id
            ));
        }
        Ok(())
    }

    fn normalize(&mut self) {
        if self.cfd.smooth_samples == 0 {
            self.cfd.smooth_samples = 1;
        }
    }
}

/// Channel parameters for the pulse-height transformer
#[derive(Debug, Clone, Deserialize)]
pub struct PhaChannelParameters {
    pub id: u8,
    pub enabled: bool,
    pub pulse_polarity: Polarity,
    pub decay_time: u32,
    pub trapezoid_risetime: u32,
    pub trapezoid_flattop: u32,
    pub trapezoid_rescaling: u32,
    pub peaking_time: u32,
    #[serde(default)]
    pub baseline_window: u32,
}

impl ChannelEntry for PhaChannelParameters {
    fn id(&self) -> u8 {
        self.id
    }
}

/// Lookup table of enabled channel parameters
#[derive(Debug, Clone)]
pub struct ChannelMap<P> {
    channels: Vec<P>,
}

impl<P> Default for ChannelMap<P> {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
        }
    }
}

impl<P: ChannelEntry> ChannelMap<P> {
    /// Build the table from a configuration document.
    ///
    /// The document must hold a non-empty `channels` array. Disabled
    /// entries are skipped without further checks; enabled entries are
    /// fully validated and a duplicated id is a hard error.
    pub fn from_config(config: &Value) -> PipelineResult<Self> {
        let entries = config
            .get("channels")
            .and_then(Value::as_array)
            .filter(|entries| !entries.is_empty())
            .ok_or_else(|| PipelineError::configure("unable to find a filled 'channels' array"))?;

        let mut channels: Vec<P> = Vec::new();

        for entry in entries {
            if entry.get("id").is_none() {
                return Err(PipelineError::configure("channel entry without an 'id'"));
            }
            let enabled = entry
                .get("enabled")
                .and_then(Value::as_bool)
                .ok_or_else(|| PipelineError::configure("channel entry without 'enabled'"))?;

            if !enabled {
                debug!(id = ?entry.get("id"), "skipping disabled channel");
                continue;
            }

            let mut parameters: P = serde_json::from_value(entry.clone()).map_err(|error| {
                PipelineError::configure(format!("invalid channel entry: {}", error))
            })?;

            if channels.iter().any(|known| known.id() == parameters.id()) {
                return Err(PipelineError::configure(format!(
                    "duplicated config for channel: {}",
                    parameters.id()
                )));
            }

            parameters.validate().map_err(PipelineError::Configure)?;
            parameters.normalize();
            channels.push(parameters);
        }

        Ok(Self { channels })
    }

    /// Parameters for `id`, if that channel is enabled
    pub fn get(&self, id: u8) -> Option<&P> {
        self.channels.iter().find(|channel| channel.id() == id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &P> {
        self.channels.iter()
    }
}
