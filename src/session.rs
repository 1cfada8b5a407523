//! The session context: one explicitly owned object tying together the bus
//! graph, plugin host, automation engine, parameters and transport. Every
//! driver (live callback, render worker, tests) works through a `Session`
//! and nothing in the crate keeps ambient global state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::automation::AutomationLane;
use crate::automation_engine::AutomationEngine;
use crate::bus::{Bus, BusId, BusKind};
use crate::bus_graph::BusGraph;
use crate::error::{EngineError, PluginLoadError, Result};
use crate::messages::{EngineCommand, EngineEvent};
use crate::midi::{MidiBlock, MidiEvent};
use crate::parameter::{ParamKey, ParameterSet};
use crate::plugin_api::PluginId;
use crate::plugin_host::PluginHost;
use crate::transport::Transport;

pub const SESSION_FORMAT_VERSION: &str = "1";

/// Serialized session document: full bus graph, loaded plugins, parameter
/// values and automation lanes, round-tripping losslessly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDoc {
    pub version: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub sample_rate: f64,
    pub bpm: f64,
    pub buses: Vec<Bus>,
    pub plugins: Vec<PluginDoc>,
    pub lanes: Vec<AutomationLane>,
    pub param_values: Vec<(ParamKey, f32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDoc {
    pub id: PluginId,
    pub path: PathBuf,
    pub bypass: bool,
}

pub struct Session {
    pub name: String,
    created_at: DateTime<Utc>,
    block_size: usize,
    pub params: Arc<ParameterSet>,
    pub transport: Arc<Transport>,
    pub graph: BusGraph,
    pub host: PluginHost,
    pub automation: AutomationEngine,
    midi_pending: MidiBlock,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("created_at", &self.created_at)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(name: impl Into<String>, sample_rate: f64, block_size: usize) -> Self {
        Self {
            name: name.into(),
            created_at: Utc::now(),
            block_size,
            params: Arc::new(ParameterSet::new()),
            transport: Arc::new(Transport::new(sample_rate, crate::constants::DEFAULT_BPM as f64)),
            graph: BusGraph::new(sample_rate, block_size),
            host: PluginHost::new(sample_rate, block_size),
            automation: AutomationEngine::new(sample_rate),
            midi_pending: MidiBlock::new(),
        }
    }

    /// Apply tunables from a loaded configuration.
    pub fn apply_config(&mut self, config: &crate::config::EngineConfig) {
        self.graph.set_idle_threshold(config.audio.idle_block_count);
    }

    pub fn sample_rate(&self) -> f64 {
        self.graph.sample_rate()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    // -- plugin lifecycle ---------------------------------------------------

    /// Load a plugin bundle onto a bus's chain and bring it up at the
    /// session rate. On failure nothing is mutated.
    pub fn load_plugin(
        &mut self,
        bus: BusId,
        path: &Path,
    ) -> std::result::Result<PluginId, PluginLoadError> {
        let id = self.host.load(path, &self.params)?;
        if let Err(e) = self.host.activate(id, self.sample_rate(), self.block_size) {
            self.host.unload(id, &self.params);
            return Err(e);
        }
        if self.graph.add_effect(bus, id).is_err() {
            self.host.unload(id, &self.params);
            return Err(PluginLoadError::InitFailure(format!("{bus} does not exist")));
        }
        self.graph.refresh_latency(&self.host);
        Ok(id)
    }

    pub fn unload_plugin(&mut self, bus: BusId, plugin: PluginId) {
        self.graph.remove_effect(bus, plugin);
        self.host.unload(plugin, &self.params);
        self.graph.refresh_latency(&self.host);
    }

    // -- processing ---------------------------------------------------------

    pub fn queue_midi(&mut self, event: MidiEvent) {
        self.midi_pending.push(event);
    }

    /// Run one block: automation, graph and transport advance together so a
    /// render worker driving this is bit-for-bit the live path.
    pub fn process_block(&mut self, out_l: &mut [f32], out_r: &mut [f32], frames: usize) {
        if self.transport.take_reposition() {
            self.host.reset_all();
            self.graph.reset_runtime();
            self.automation.reset_smoothing();
        }

        let playing = self.transport.is_playing();
        if playing {
            self.automation
                .process_block(self.transport.position(), frames, &self.params);
        }

        let midi = std::mem::take(&mut self.midi_pending);
        self.graph
            .process_block(&mut self.host, &self.params, &midi, out_l, out_r, frames);

        if playing {
            self.transport.advance(frames);
        }
    }

    /// Apply one control-domain command. The caller invokes this between
    /// blocks, which is what makes routing changes atomic at block
    /// boundaries.
    pub fn apply_command(&mut self, cmd: EngineCommand) -> Option<EngineEvent> {
        match cmd {
            EngineCommand::Play => {
                self.transport.play();
                None
            }
            EngineCommand::Stop => {
                self.transport.stop();
                self.automation.stop();
                None
            }
            EngineCommand::Pause => {
                self.transport.pause();
                None
            }
            EngineCommand::Seek(seconds) => {
                self.transport.set_position(seconds);
                None
            }
            EngineCommand::SetBpm(bpm) => {
                self.transport.set_bpm(bpm);
                None
            }
            EngineCommand::CreateBus { kind, name } => match self
                .graph
                .create_bus(kind, name, &self.params)
            {
                Ok(id) => Some(EngineEvent::BusAdded(id)),
                Err(e) => Some(EngineEvent::Error(e.to_string())),
            },
            EngineCommand::RemoveBus(id) => match self.graph.remove_bus(id, &self.params) {
                Ok(()) => Some(EngineEvent::BusRemoved(id)),
                Err(e) => Some(EngineEvent::Error(e.to_string())),
            },
            EngineCommand::Connect { from, to, send } => {
                match self.graph.connect(from, to, send, &self.params) {
                    Ok(()) => {
                        self.graph.refresh_latency(&self.host);
                        None
                    }
                    Err(e) => Some(EngineEvent::Error(e.to_string())),
                }
            }
            EngineCommand::Disconnect { from, to } => match self.graph.disconnect(from, to) {
                Ok(()) => {
                    self.graph.refresh_latency(&self.host);
                    None
                }
                Err(e) => Some(EngineEvent::Error(e.to_string())),
            },
            EngineCommand::SetOutput { bus, target } => {
                match self.graph.set_output(bus, target) {
                    Ok(()) => {
                        self.graph.refresh_latency(&self.host);
                        None
                    }
                    Err(e) => Some(EngineEvent::Error(e.to_string())),
                }
            }
            EngineCommand::SetMute(bus, mute) => {
                self.graph.set_mute(bus, mute);
                None
            }
            EngineCommand::SetSolo(bus, solo) => {
                self.graph.set_solo(bus, solo);
                None
            }
            EngineCommand::LoadPlugin { bus, path } => match self.load_plugin(bus, &path) {
                Ok(plugin) => Some(EngineEvent::PluginLoaded { bus, plugin }),
                Err(e) => Some(EngineEvent::Error(e.to_string())),
            },
            EngineCommand::UnloadPlugin { bus, plugin } => {
                self.unload_plugin(bus, plugin);
                Some(EngineEvent::PluginUnloaded { bus, plugin })
            }
            EngineCommand::BypassPlugin(plugin, bypass) => {
                self.host.set_bypass(plugin, bypass);
                self.graph.refresh_latency(&self.host);
                None
            }
            EngineCommand::SetAutomationMode(key, mode) => {
                self.automation.request_mode(key, mode);
                None
            }
            EngineCommand::BeginTouch(key) => {
                self.automation.begin_touch(&key);
                None
            }
            EngineCommand::EndTouch(key) => {
                self.automation.end_touch(&key);
                None
            }
            EngineCommand::RecordControl(key, value) => {
                self.automation.record_event(&key, value);
                None
            }
            EngineCommand::Midi(event) => {
                self.queue_midi(event);
                None
            }
        }
    }

    // -- persistence --------------------------------------------------------

    pub fn to_doc(&self) -> SessionDoc {
        let mut param_values: Vec<(ParamKey, f32)> = self
            .params
            .keys()
            .into_iter()
            .filter_map(|key| self.params.get(&key).map(|p| (key, p.get())))
            .collect();
        param_values.sort_by(|a, b| format!("{:?}", a.0).cmp(&format!("{:?}", b.0)));

        let mut plugins: Vec<PluginDoc> = self
            .host
            .instances()
            .map(|inst| PluginDoc { id: inst.id, path: inst.path.clone(), bypass: inst.bypass })
            .collect();
        plugins.sort_by_key(|p| p.id);

        SessionDoc {
            version: SESSION_FORMAT_VERSION.to_string(),
            name: self.name.clone(),
            created_at: self.created_at,
            modified_at: Utc::now(),
            sample_rate: self.sample_rate(),
            bpm: self.transport.bpm(),
            buses: self.graph.export_buses(),
            plugins,
            lanes: self.automation.lanes().cloned().collect(),
            param_values,
        }
    }

    /// Rebuild a session from a document. Plugin instances are reloaded from
    /// their bundle paths; chain references and parameter keys are remapped
    /// onto the fresh instance ids.
    pub fn from_doc(doc: &SessionDoc, block_size: usize) -> Result<Self> {
        let mut session = Session::new(doc.name.clone(), doc.sample_rate, block_size);
        session.created_at = doc.created_at;
        session.transport.set_bpm(doc.bpm);

        let mut buses = doc.buses.clone();

        let mut id_map: HashMap<PluginId, PluginId> = HashMap::new();
        for plugin in &doc.plugins {
            let new_id = session
                .host
                .load(&plugin.path, &session.params)
                .map_err(|e| EngineError::Config(format!("session plugin reload: {e}")))?;
            session
                .host
                .activate(new_id, doc.sample_rate, block_size)
                .map_err(EngineError::from)?;
            session.host.set_bypass(new_id, plugin.bypass);
            id_map.insert(plugin.id, new_id);
        }

        for bus in &mut buses {
            for effect in &mut bus.effects {
                *effect = *id_map.get(effect).ok_or_else(|| {
                    EngineError::Config(format!("bus {} references unknown {effect}", bus.name))
                })?;
            }
        }
        session.graph.import_buses(buses, &session.params)?;
        session.graph.refresh_latency(&session.host);

        let remap_key = |key: &ParamKey| -> ParamKey {
            match key {
                ParamKey::Plugin { plugin, param } => match id_map.get(plugin) {
                    Some(new_id) => ParamKey::Plugin { plugin: *new_id, param: param.clone() },
                    None => key.clone(),
                },
                other => other.clone(),
            }
        };

        for (key, value) in &doc.param_values {
            if let Some(param) = session.params.get(&remap_key(key)) {
                param.set(*value);
                param.latch_block();
            }
        }

        let lanes = doc
            .lanes
            .iter()
            .map(|lane| {
                let mut lane = lane.clone();
                lane.target = remap_key(&lane.target);
                lane
            })
            .collect();
        session.automation.set_lanes(lanes);

        Ok(session)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let doc = self.to_doc();
        let json = serde_json::to_string_pretty(&doc)
            .map_err(|e| EngineError::Config(format!("session serialize: {e}")))?;
        std::fs::write(path, json).map_err(|e| EngineError::Config(e.to_string()))?;
        log::info!("Saved session '{}' to {}", self.name, path.display());
        Ok(())
    }

    pub fn load(path: &Path, block_size: usize) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        let doc: SessionDoc = serde_json::from_str(&text)
            .map_err(|e| EngineError::Config(format!("malformed session: {e}")))?;
        Self::from_doc(&doc, block_size)
    }

    /// Convenience constructor used by front ends and tests: a track routed
    /// to the master.
    pub fn add_track(&mut self, name: impl Into<String>) -> Result<BusId> {
        self.graph.create_bus(BusKind::Track, name, &self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::AutomationPoint;
    use crate::bus::SendSpec;
    use crate::parameter::TrackControl;

    #[test]
    fn doc_round_trip_preserves_graph_params_and_lanes() {
        let mut session = Session::new("Round Trip", 48000.0, 256);
        let track = session.add_track("Bass").unwrap();
        let aux = session
            .graph
            .create_bus(BusKind::Aux, "Verb", &session.params)
            .unwrap();
        session
            .graph
            .connect(track, aux, SendSpec::post_fader(aux, 0.33), &session.params)
            .unwrap();
        session.graph.set_mute(aux, true);

        let vol_key = ParamKey::TrackControl { bus: track, control: TrackControl::Volume };
        let param = session.params.get(&vol_key).unwrap();
        param.set(0.42);
        param.latch_block();

        let lane = session.automation.create_lane(vol_key.clone());
        lane.insert(0.0, AutomationPoint::linear(0.1));
        lane.insert(1.5, AutomationPoint::linear(0.8));

        let doc = session.to_doc();
        let json = serde_json::to_string(&doc).unwrap();
        let parsed: SessionDoc = serde_json::from_str(&json).unwrap();
        let restored = Session::from_doc(&parsed, 256).unwrap();

        assert_eq!(restored.graph.export_buses(), session.graph.export_buses());
        assert_eq!(restored.params.get(&vol_key).unwrap().get(), 0.42);
        let lane = restored.automation.lane(&vol_key).unwrap();
        assert_eq!(lane.as_points(), vec![(0.0, 0.1), (1.5, 0.8)]);
        // And the round trip is a fixed point.
        assert_eq!(
            serde_json::to_string(&restored.to_doc().buses).unwrap(),
            serde_json::to_string(&doc.buses).unwrap()
        );
    }

    #[test]
    fn malformed_session_is_a_config_error_with_no_partial_state() {
        let path = std::env::temp_dir().join(format!("mixcore-bad-{}.mixcore", std::process::id()));
        std::fs::write(&path, "{ not a session").unwrap();
        let err = Session::load(&path, 256).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn commands_apply_and_report() {
        let mut session = Session::new("Cmd", 44100.0, 128);
        let event = session.apply_command(EngineCommand::CreateBus {
            kind: BusKind::Group,
            name: "Drums".into(),
        });
        let Some(EngineEvent::BusAdded(id)) = event else {
            panic!("expected BusAdded, got {event:?}");
        };
        session.apply_command(EngineCommand::SetSolo(id, true));
        assert!(session.graph.any_solo());

        session.apply_command(EngineCommand::Play);
        assert!(session.transport.is_playing());
        session.apply_command(EngineCommand::Stop);
        assert!(!session.transport.is_playing());
    }

    #[test]
    fn processing_silence_produces_silence() {
        let mut session = Session::new("Quiet", 44100.0, 128);
        session.add_track("Empty").unwrap();
        session.transport.play();
        let mut l = vec![1.0f32; 128];
        let mut r = vec![1.0f32; 128];
        session.process_block(&mut l, &mut r, 128);
        assert!(l.iter().all(|s| *s == 0.0));
        assert!(r.iter().all(|s| *s == 0.0));
    }
}
