use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_MASTER_VOLUME, DEFAULT_TRACK_VOLUME};
use crate::plugin_api::PluginId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusId(pub u64);

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bus#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusKind {
    /// Audio-carrying leaf fed by an instrument chain or external input.
    Track,
    Group,
    Aux,
    Monitor,
    Master,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelStrip {
    pub volume: f32,
    pub pan: f32,
    pub mute: bool,
    pub solo: bool,
    pub phase_invert: bool,
}

impl Default for ChannelStrip {
    fn default() -> Self {
        Self {
            volume: DEFAULT_TRACK_VOLUME,
            pan: 0.0,
            mute: false,
            solo: false,
            phase_invert: false,
        }
    }
}

/// An auxiliary send from one bus into another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendSpec {
    pub target: BusId,
    pub level: f32,
    pub pre_fader: bool,
    pub enabled: bool,
}

impl SendSpec {
    pub fn post_fader(target: BusId, level: f32) -> Self {
        Self { target, level, pre_fader: false, enabled: true }
    }
}

/// A named audio-carrying node in the routing graph. Pure model state; all
/// processing scratch (buffers, meters, compensation delays) lives with the
/// graph runtime so this serializes cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bus {
    pub id: BusId,
    pub name: String,
    pub kind: BusKind,
    pub strip: ChannelStrip,
    /// Ordered effects chain.
    pub effects: Vec<PluginId>,
    pub sends: Vec<SendSpec>,
    /// Primary output routing; `None` only for the master bus.
    pub output: Option<BusId>,
}

impl Bus {
    pub fn new(id: BusId, kind: BusKind, name: impl Into<String>) -> Self {
        let mut strip = ChannelStrip::default();
        if kind == BusKind::Master {
            strip.volume = DEFAULT_MASTER_VOLUME;
        }
        Self {
            id,
            name: name.into(),
            kind,
            strip,
            effects: Vec::new(),
            sends: Vec::new(),
            output: None,
        }
    }

    pub fn is_master(&self) -> bool {
        self.kind == BusKind::Master
    }

    /// All buses this one feeds: the primary output plus enabled sends.
    pub fn downstream(&self) -> impl Iterator<Item = BusId> + '_ {
        self.output
            .into_iter()
            .chain(self.sends.iter().filter(|s| s.enabled).map(|s| s.target))
    }
}
