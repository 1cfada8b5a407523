use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::PluginLoadError;
use crate::midi::MidiEvent;

/// Stable identity of a loaded plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginId(pub u64);

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "plugin#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PluginCategory {
    Instrument,
    Effect,
    Analyzer,
    Unknown,
}

/// Parameter metadata reported across the plugin boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamInfo {
    pub id: String,
    pub name: String,
    pub min: f32,
    pub max: f32,
    pub default: f32,
    pub unit: Option<String>,
}

/// Audio/MIDI channel layout of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortLayout {
    pub audio_inputs: usize,
    pub audio_outputs: usize,
    pub midi_input: bool,
    pub midi_output: bool,
}

/// The one capability interface every hosted processing unit implements,
/// whatever format its bundle was discovered in.
pub trait PluginProcessor: Send {
    fn params(&self) -> Vec<ParamInfo>;

    fn ports(&self) -> PortLayout;

    fn category(&self) -> PluginCategory {
        PluginCategory::Effect
    }

    /// Apply a parameter value. The host only calls this at block boundaries
    /// with already-clamped values.
    fn set_param(&mut self, id: &str, value: f32);

    /// Prepare for processing at the given sample rate and maximum block
    /// size. May allocate; never called on the audio thread.
    fn activate(&mut self, sample_rate: f64, max_block_size: usize) -> anyhow::Result<()>;

    /// Flush internal state (delay lines, voices, envelopes) after a
    /// transport reposition.
    fn reset(&mut self);

    /// Fixed processing latency in samples, used for delay compensation.
    fn latency_samples(&self) -> usize {
        0
    }

    /// Process one block. Realtime-safe: implementations must not allocate,
    /// lock or panic. `output_*` arrive zeroed.
    fn process(
        &mut self,
        input_l: &[f32],
        input_r: &[f32],
        output_l: &mut [f32],
        output_r: &mut [f32],
        midi: &[MidiEvent],
        frames: usize,
    );
}

/// Manifest found at the root of every plugin bundle. Structural validity of
/// this document is what discovery checks before a bundle is listed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    /// Processor kind the format factory keys on, e.g. "gain" or "sine".
    pub kind: String,
    pub version: String,
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl PluginManifest {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("manifest has an empty name".into());
        }
        if self.kind.trim().is_empty() {
            return Err("manifest has an empty kind".into());
        }
        Ok(())
    }
}

/// A discovered, structurally valid bundle.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub path: PathBuf,
    pub manifest: PluginManifest,
    pub category: PluginCategory,
}

/// One plugin format implementation (native, or an adapter for an external
/// format). The host selects the first format claiming the bundle's kind.
pub trait PluginFormat: Send + Sync {
    fn format_name(&self) -> &'static str;

    fn can_load(&self, manifest: &PluginManifest) -> bool;

    fn instantiate(
        &self,
        manifest: &PluginManifest,
    ) -> std::result::Result<Box<dyn PluginProcessor>, PluginLoadError>;
}
