use std::path::PathBuf;

use crate::automation::AutomationMode;
use crate::bus::{BusId, BusKind, SendSpec};
use crate::midi::MidiEvent;
use crate::parameter::ParamKey;
use crate::plugin_api::PluginId;

/// Control-domain requests, drained by the processing side once per block so
/// every structural change lands exactly on a block boundary.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    Play,
    Stop,
    Pause,
    Seek(f64),
    SetBpm(f64),

    CreateBus { kind: BusKind, name: String },
    RemoveBus(BusId),
    Connect { from: BusId, to: BusId, send: SendSpec },
    Disconnect { from: BusId, to: BusId },
    SetOutput { bus: BusId, target: Option<BusId> },
    SetMute(BusId, bool),
    SetSolo(BusId, bool),

    LoadPlugin { bus: BusId, path: PathBuf },
    UnloadPlugin { bus: BusId, plugin: PluginId },
    BypassPlugin(PluginId, bool),

    SetAutomationMode(ParamKey, AutomationMode),
    BeginTouch(ParamKey),
    EndTouch(ParamKey),
    RecordControl(ParamKey, f32),

    Midi(MidiEvent),
}

/// Notifications flowing back to the control surface.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    BusAdded(BusId),
    BusRemoved(BusId),
    PluginLoaded { bus: BusId, plugin: PluginId },
    PluginUnloaded { bus: BusId, plugin: PluginId },

    /// A plugin blew its block budget; its output was silenced for the
    /// offending blocks.
    PerformanceWarning { plugin: PluginId, overruns: u32 },

    /// The audio device disappeared; this one is fatal to the live engine.
    DeviceLost(String),

    Error(String),
    Warning(String),
    Info(String),
}
