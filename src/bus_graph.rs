//! The audio bus graph: an arena of buses indexed by stable id with routing
//! stored as edge lists, processed each block in topological order.
//!
//! Structural edits (create/remove/connect/solo/mute) are control-domain
//! calls; the engine drains them from its command queue at block boundaries,
//! so the processing pass below never observes a half-applied routing change.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use smallvec::SmallVec;

use crate::audio_utils::{calculate_stereo_gains, is_silent, soft_clip};
use crate::bus::{Bus, BusId, BusKind, SendSpec};
use crate::constants::{
    DEFAULT_IDLE_BLOCK_COUNT, DEFAULT_MASTER_VOLUME, DEFAULT_TRACK_VOLUME, MAX_BLOCK_SIZE,
    SILENCE_THRESHOLD,
};
use crate::error::{EngineError, Result};
use crate::loudness::LoudnessAnalyzer;
use crate::metering::{BusMeter, MeterBank, MeterReading};
use crate::midi::{MidiBlock, MidiEvent};
use crate::parameter::{ParamKey, ParamRange, Parameter, ParameterSet, TrackControl};
use crate::pdc::DelayLine;
use crate::plugin_host::PluginHost;

struct BusRuntime {
    in_l: Vec<f32>,
    in_r: Vec<f32>,
    meter: BusMeter,
    loudness: Option<LoudnessAnalyzer>,
    idle_blocks: u32,
}

impl BusRuntime {
    fn new(sample_rate: f64, max_block: usize, with_loudness: bool) -> Self {
        Self {
            in_l: vec![0.0; max_block],
            in_r: vec![0.0; max_block],
            meter: BusMeter::new(sample_rate as f32),
            loudness: with_loudness.then(|| LoudnessAnalyzer::new(sample_rate)),
            idle_blocks: 0,
        }
    }
}

pub struct BusGraph {
    buses: HashMap<BusId, Bus>,
    runtime: HashMap<BusId, BusRuntime>,
    edge_delays: HashMap<(BusId, BusId), DelayLine>,
    order: Vec<BusId>,
    master: BusId,
    next_id: u64,
    sample_rate: f64,
    max_block: usize,
    idle_threshold: u32,
    solo_active: bool,
    audible: HashSet<BusId>,
    meters: MeterBank,
    /// Post-fader taps copied out for render targets (master and stems).
    captures: HashMap<BusId, (Vec<f32>, Vec<f32>)>,
    // Scratch buffers reused every block; nothing below allocates.
    work_l: Vec<f32>,
    work_r: Vec<f32>,
    post_l: Vec<f32>,
    post_r: Vec<f32>,
    edge_l: Vec<f32>,
    edge_r: Vec<f32>,
}

impl BusGraph {
    pub fn new(sample_rate: f64, max_block: usize) -> Self {
        let max_block = max_block.min(MAX_BLOCK_SIZE);
        let mut graph = Self {
            buses: HashMap::new(),
            runtime: HashMap::new(),
            edge_delays: HashMap::new(),
            order: Vec::new(),
            master: BusId(0),
            next_id: 0,
            sample_rate,
            max_block,
            idle_threshold: DEFAULT_IDLE_BLOCK_COUNT,
            solo_active: false,
            audible: HashSet::new(),
            meters: Arc::new(DashMap::new()),
            captures: HashMap::new(),
            work_l: vec![0.0; max_block],
            work_r: vec![0.0; max_block],
            post_l: vec![0.0; max_block],
            post_r: vec![0.0; max_block],
            edge_l: vec![0.0; max_block],
            edge_r: vec![0.0; max_block],
        };
        let master = graph.alloc_id();
        graph.buses.insert(master, Bus::new(master, BusKind::Master, "Master"));
        // The master is the one bus that always carries a loudness analyzer.
        graph
            .runtime
            .insert(master, BusRuntime::new(sample_rate, max_block, true));
        graph.master = master;
        graph.recompute_order();
        graph
    }

    fn alloc_id(&mut self) -> BusId {
        let id = BusId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn master(&self) -> BusId {
        self.master
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn meters(&self) -> MeterBank {
        self.meters.clone()
    }

    pub fn latest_reading(&self, bus: BusId) -> Option<MeterReading> {
        self.meters.get(&bus).map(|r| *r)
    }

    pub fn set_idle_threshold(&mut self, blocks: u32) {
        self.idle_threshold = blocks;
    }

    pub fn bus(&self, id: BusId) -> Option<&Bus> {
        self.buses.get(&id)
    }

    pub fn bus_mut(&mut self, id: BusId) -> Option<&mut Bus> {
        self.buses.get_mut(&id)
    }

    pub fn buses(&self) -> impl Iterator<Item = &Bus> {
        self.buses.values()
    }

    pub fn find_by_name(&self, name: &str) -> Option<BusId> {
        self.buses.values().find(|b| b.name == name).map(|b| b.id)
    }

    // -- structural edits ---------------------------------------------------

    /// Create a bus. Non-master buses default their primary output to the
    /// master (monitor buses start unrouted). Strip parameters are
    /// registered so automation and the control surface can address them.
    pub fn create_bus(
        &mut self,
        kind: BusKind,
        name: impl Into<String>,
        params: &ParameterSet,
    ) -> Result<BusId> {
        if kind == BusKind::Master {
            return Err(EngineError::Config("a graph has exactly one master bus".into()));
        }
        let id = self.alloc_id();
        let mut bus = Bus::new(id, kind, name);
        if kind != BusKind::Monitor {
            bus.output = Some(self.master);
        }
        self.register_strip_params(&bus, params);
        self.buses.insert(id, bus);
        self.runtime
            .insert(id, BusRuntime::new(self.sample_rate, self.max_block, false));
        self.recompute_order();
        self.recompute_audible();
        Ok(id)
    }

    fn register_strip_params(&self, bus: &Bus, params: &ParameterSet) {
        let default_volume = if bus.is_master() { DEFAULT_MASTER_VOLUME } else { DEFAULT_TRACK_VOLUME };
        params.register(Parameter::new(
            ParamKey::TrackControl { bus: bus.id, control: TrackControl::Volume },
            format!("{} Volume", bus.name),
            ParamRange::new(0.0, 2.0, default_volume),
        ));
        params.register(Parameter::new(
            ParamKey::TrackControl { bus: bus.id, control: TrackControl::Pan },
            format!("{} Pan", bus.name),
            ParamRange::new(-1.0, 1.0, 0.0),
        ));
    }

    /// Remove a bus and every edge touching it.
    pub fn remove_bus(&mut self, id: BusId, params: &ParameterSet) -> Result<()> {
        if id == self.master {
            return Err(EngineError::Config("the master bus cannot be removed".into()));
        }
        if self.buses.remove(&id).is_none() {
            return Err(EngineError::Config(format!("{id} does not exist")));
        }
        self.runtime.remove(&id);
        for bus in self.buses.values_mut() {
            if bus.output == Some(id) {
                bus.output = None;
            }
            bus.sends.retain(|s| s.target != id);
        }
        self.edge_delays.retain(|(from, to), _| *from != id && *to != id);
        params.unregister(&ParamKey::TrackControl { bus: id, control: TrackControl::Volume });
        params.unregister(&ParamKey::TrackControl { bus: id, control: TrackControl::Pan });
        self.recompute_order();
        self.recompute_audible();
        Ok(())
    }

    /// Add a send edge. Rejects edges that would close a cycle.
    pub fn connect(
        &mut self,
        from: BusId,
        to: BusId,
        send: SendSpec,
        params: &ParameterSet,
    ) -> Result<()> {
        if !self.buses.contains_key(&from) || !self.buses.contains_key(&to) {
            return Err(EngineError::Config(format!("cannot connect {from} -> {to}: no such bus")));
        }
        if from == to || self.reaches(to, from) {
            return Err(EngineError::Config(format!(
                "connecting {from} -> {to} would create a cycle"
            )));
        }
        let bus = self.buses.get_mut(&from).expect("existence checked");
        let index = bus.sends.len() as u32;
        let level = send.level;
        let mut spec = send;
        spec.target = to;
        bus.sends.push(spec);
        params.register(Parameter::new(
            ParamKey::TrackControl { bus: from, control: TrackControl::SendLevel(index) },
            format!("{} Send {}", bus.name, index + 1),
            ParamRange::new(0.0, 1.5, level),
        ));
        self.edge_delays.entry((from, to)).or_insert_with(|| DelayLine::new(0));
        self.recompute_order();
        self.recompute_audible();
        Ok(())
    }

    pub fn disconnect(&mut self, from: BusId, to: BusId) -> Result<()> {
        let bus = self
            .buses
            .get_mut(&from)
            .ok_or_else(|| EngineError::Config(format!("{from} does not exist")))?;
        let before = bus.sends.len();
        bus.sends.retain(|s| s.target != to);
        if bus.sends.len() == before && bus.output != Some(to) {
            return Err(EngineError::Config(format!("no edge {from} -> {to}")));
        }
        if bus.output == Some(to) {
            bus.output = None;
        }
        self.edge_delays.remove(&(from, to));
        self.recompute_order();
        self.recompute_audible();
        Ok(())
    }

    /// Re-route a bus's primary output.
    pub fn set_output(&mut self, bus: BusId, target: Option<BusId>) -> Result<()> {
        if let Some(t) = target {
            if !self.buses.contains_key(&t) {
                return Err(EngineError::Config(format!("{t} does not exist")));
            }
            if bus == t || self.reaches(t, bus) {
                return Err(EngineError::Config(format!(
                    "routing {bus} -> {t} would create a cycle"
                )));
            }
            self.edge_delays.entry((bus, t)).or_insert_with(|| DelayLine::new(0));
        }
        let b = self
            .buses
            .get_mut(&bus)
            .ok_or_else(|| EngineError::Config(format!("{bus} does not exist")))?;
        b.output = target;
        self.recompute_order();
        self.recompute_audible();
        Ok(())
    }

    /// True if `to` is reachable from `from` along downstream edges.
    fn reaches(&self, from: BusId, to: BusId) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(bus) = self.buses.get(&id) {
                stack.extend(bus.downstream());
            }
        }
        false
    }

    pub fn add_effect(&mut self, bus: BusId, plugin: crate::plugin_api::PluginId) -> Result<()> {
        self.buses
            .get_mut(&bus)
            .ok_or_else(|| EngineError::Config(format!("{bus} does not exist")))?
            .effects
            .push(plugin);
        Ok(())
    }

    pub fn remove_effect(&mut self, bus: BusId, plugin: crate::plugin_api::PluginId) {
        if let Some(b) = self.buses.get_mut(&bus) {
            b.effects.retain(|p| *p != plugin);
        }
    }

    pub fn enable_loudness(&mut self, bus: BusId, enabled: bool) {
        if let Some(rt) = self.runtime.get_mut(&bus) {
            if enabled && rt.loudness.is_none() {
                rt.loudness = Some(LoudnessAnalyzer::new(self.sample_rate));
            } else if !enabled {
                rt.loudness = None;
            }
        }
    }

    // -- solo / mute --------------------------------------------------------

    pub fn set_mute(&mut self, bus: BusId, mute: bool) {
        if let Some(b) = self.buses.get_mut(&bus) {
            b.strip.mute = mute;
        }
    }

    /// Solo-in-place. Stored mute flags are never rewritten; audibility is
    /// derived, so clearing the last solo restores prior mute state for
    /// free.
    pub fn set_solo(&mut self, bus: BusId, solo: bool) {
        if let Some(b) = self.buses.get_mut(&bus) {
            b.strip.solo = solo;
        }
        self.recompute_audible();
    }

    pub fn any_solo(&self) -> bool {
        self.solo_active
    }

    pub fn is_audible(&self, bus: BusId) -> bool {
        let Some(b) = self.buses.get(&bus) else { return false };
        if b.strip.mute {
            return false;
        }
        !self.solo_active || self.audible.contains(&bus)
    }

    fn recompute_audible(&mut self) {
        let soloed: Vec<BusId> =
            self.buses.values().filter(|b| b.strip.solo).map(|b| b.id).collect();
        self.solo_active = !soloed.is_empty();
        self.audible.clear();
        if !self.solo_active {
            return;
        }

        // Upstream adjacency: who feeds whom.
        let mut feeders: HashMap<BusId, Vec<BusId>> = HashMap::new();
        for bus in self.buses.values() {
            for target in bus.downstream() {
                feeders.entry(target).or_default().push(bus.id);
            }
        }

        for &s in &soloed {
            // The soloed bus, everything on its path to the master...
            let mut stack = vec![s];
            while let Some(id) = stack.pop() {
                if self.audible.insert(id) {
                    if let Some(bus) = self.buses.get(&id) {
                        stack.extend(bus.downstream());
                    }
                }
            }
            // ...and everything feeding it.
            let mut stack = vec![s];
            let mut seen = HashSet::new();
            while let Some(id) = stack.pop() {
                if !seen.insert(id) {
                    continue;
                }
                self.audible.insert(id);
                if let Some(sources) = feeders.get(&id) {
                    stack.extend(sources.iter().copied());
                }
            }
        }
    }

    // -- ordering and delay compensation ------------------------------------

    /// Kahn's algorithm: sources first, so every bus is processed after all
    /// of its feeders.
    fn recompute_order(&mut self) {
        let mut indegree: HashMap<BusId, usize> =
            self.buses.keys().map(|id| (*id, 0)).collect();
        for bus in self.buses.values() {
            for target in bus.downstream() {
                if let Some(d) = indegree.get_mut(&target) {
                    *d += 1;
                }
            }
        }
        let mut ready: Vec<BusId> =
            indegree.iter().filter(|(_, d)| **d == 0).map(|(id, _)| *id).collect();
        ready.sort();
        self.order.clear();
        while let Some(id) = ready.pop() {
            self.order.push(id);
            if let Some(bus) = self.buses.get(&id) {
                for target in bus.downstream() {
                    let d = indegree.get_mut(&target).expect("edge targets exist");
                    *d -= 1;
                    if *d == 0 {
                        ready.push(target);
                    }
                }
            }
        }
        debug_assert_eq!(self.order.len(), self.buses.len(), "graph must stay acyclic");
    }

    /// Recompute compensation delays from currently reported chain
    /// latencies: every edge into a bus is padded to the longest-latency
    /// path arriving there.
    pub fn refresh_latency(&mut self, host: &PluginHost) {
        let mut output_latency: HashMap<BusId, usize> = HashMap::new();

        for &id in &self.order {
            let bus = &self.buses[&id];
            let mut arrivals: Vec<(BusId, usize)> = Vec::new();
            for other in self.buses.values() {
                if other.downstream().any(|t| t == id) {
                    arrivals.push((other.id, output_latency[&other.id]));
                }
            }
            let in_lat = arrivals.iter().map(|(_, l)| *l).max().unwrap_or(0);
            output_latency.insert(id, in_lat + host.chain_latency(&bus.effects));

            for (src, arrival) in arrivals {
                let delay = in_lat - arrival;
                self.edge_delays
                    .entry((src, id))
                    .or_insert_with(|| DelayLine::new(0))
                    .set_delay(delay);
            }
        }
    }

    /// Compensation currently inserted on the edge `from -> to`.
    pub fn compensation_delay(&self, from: BusId, to: BusId) -> usize {
        self.edge_delays.get(&(from, to)).map_or(0, |d| d.delay_samples())
    }

    /// Total signal-path latency from a bus to the master.
    pub fn path_latency_to_master(&self, bus: BusId, host: &PluginHost) -> usize {
        let mut latency = 0;
        let mut current = bus;
        loop {
            let Some(b) = self.buses.get(&current) else { break };
            latency += host.chain_latency(&b.effects);
            match b.output {
                Some(next) => {
                    latency += self.compensation_delay(current, next);
                    current = next;
                }
                None => break,
            }
        }
        latency
    }

    // -- processing ---------------------------------------------------------

    /// Arm post-fader capture taps on the given buses; each processed block
    /// leaves a copy of their output readable via `captured`.
    pub fn set_captures(&mut self, buses: &[BusId]) {
        self.captures = buses
            .iter()
            .map(|id| (*id, (vec![0.0; self.max_block], vec![0.0; self.max_block])))
            .collect();
    }

    pub fn captured(&self, bus: BusId) -> Option<(&[f32], &[f32])> {
        self.captures.get(&bus).map(|(l, r)| (l.as_slice(), r.as_slice()))
    }

    /// Inject external audio into a track bus's accumulator for the next
    /// block (clip playback, live input).
    pub fn feed_input(&mut self, bus: BusId, left: &[f32], right: &[f32]) {
        if let Some(rt) = self.runtime.get_mut(&bus) {
            let n = left.len().min(rt.in_l.len());
            for i in 0..n {
                rt.in_l[i] += left[i];
                rt.in_r[i] += right[i];
            }
        }
    }

    /// Flush delay lines, meters and idle state after a transport
    /// reposition.
    pub fn reset_runtime(&mut self) {
        for rt in self.runtime.values_mut() {
            rt.in_l.fill(0.0);
            rt.in_r.fill(0.0);
            rt.meter.reset();
            if let Some(la) = &mut rt.loudness {
                la.reset();
            }
            rt.idle_blocks = 0;
        }
        for delay in self.edge_delays.values_mut() {
            delay.clear();
        }
    }

    /// Process one block through the whole graph, writing the master output
    /// into `out_l`/`out_r`.
    pub fn process_block(
        &mut self,
        host: &mut PluginHost,
        params: &ParameterSet,
        midi: &[MidiEvent],
        out_l: &mut [f32],
        out_r: &mut [f32],
        frames: usize,
    ) {
        debug_assert!(frames <= self.max_block);

        for idx in 0..self.order.len() {
            let id = self.order[idx];
            let bus = self.buses.get_mut(&id).expect("order tracks the arena");
            let rt = self.runtime.get_mut(&id).expect("runtime tracks the arena");

            self.work_l[..frames].copy_from_slice(&rt.in_l[..frames]);
            self.work_r[..frames].copy_from_slice(&rt.in_r[..frames]);
            rt.in_l[..frames].fill(0.0);
            rt.in_r[..frames].fill(0.0);

            let bus_midi: MidiBlock = if bus.kind == BusKind::Track {
                midi.iter().filter(|e| e.track == id).copied().collect()
            } else {
                MidiBlock::new()
            };

            let fed = !is_silent(&self.work_l[..frames], SILENCE_THRESHOLD)
                || !is_silent(&self.work_r[..frames], SILENCE_THRESHOLD)
                || !bus_midi.is_empty();
            if fed {
                rt.idle_blocks = 0;
            } else {
                rt.idle_blocks = rt.idle_blocks.saturating_add(1);
            }

            if !bus.is_master() && rt.idle_blocks > self.idle_threshold {
                rt.meter.update_silent(frames);
                let loudness = rt.loudness.as_ref().map(|l| l.reading());
                self.meters.insert(id, rt.meter.reading(loudness));
                if let Some((cap_l, cap_r)) = self.captures.get_mut(&id) {
                    cap_l[..frames].fill(0.0);
                    cap_r[..frames].fill(0.0);
                }
                continue;
            }

            host.process_chain(
                &bus.effects,
                &mut self.work_l[..frames],
                &mut self.work_r[..frames],
                &bus_midi,
                frames,
            );

            let volume = params
                .get(&ParamKey::TrackControl { bus: id, control: TrackControl::Volume })
                .map(|p| p.latch_block())
                .unwrap_or(bus.strip.volume);
            let pan = params
                .get(&ParamKey::TrackControl { bus: id, control: TrackControl::Pan })
                .map(|p| p.latch_block())
                .unwrap_or(bus.strip.pan);
            bus.strip.volume = volume;
            bus.strip.pan = pan;

            let (gain_l, gain_r) = calculate_stereo_gains(volume, pan);
            let phase = if bus.strip.phase_invert { -1.0 } else { 1.0 };
            let suppressed = self.solo_active && !self.audible.contains(&id);
            let silenced = bus.strip.mute || suppressed;

            if silenced {
                self.post_l[..frames].fill(0.0);
                self.post_r[..frames].fill(0.0);
            } else {
                for i in 0..frames {
                    self.post_l[i] = self.work_l[i] * gain_l * phase;
                    self.post_r[i] = self.work_r[i] * gain_r * phase;
                }
            }

            rt.meter.update(&self.post_l[..frames], &self.post_r[..frames], frames);
            if let Some(la) = &mut rt.loudness {
                la.process(&self.post_l[..frames], &self.post_r[..frames], frames);
            }
            let loudness = rt.loudness.as_ref().map(|l| l.reading());
            self.meters.insert(id, rt.meter.reading(loudness));

            if bus.is_master() {
                for i in 0..frames {
                    out_l[i] = soft_clip(self.post_l[i]);
                    out_r[i] = soft_clip(self.post_r[i]);
                }
                if let Some((cap_l, cap_r)) = self.captures.get_mut(&id) {
                    cap_l[..frames].copy_from_slice(&out_l[..frames]);
                    cap_r[..frames].copy_from_slice(&out_r[..frames]);
                }
            } else if let Some((cap_l, cap_r)) = self.captures.get_mut(&id) {
                cap_l[..frames].copy_from_slice(&self.post_l[..frames]);
                cap_r[..frames].copy_from_slice(&self.post_r[..frames]);
            }

            if silenced {
                continue;
            }

            // Push into each downstream bus through that edge's
            // compensation delay. Contributions sharing an edge are summed
            // first so the delay line runs once per edge.
            let mut targets: SmallVec<[BusId; 8]> = SmallVec::new();
            for t in bus.downstream() {
                if !targets.contains(&t) {
                    targets.push(t);
                }
            }

            for target in targets {
                self.edge_l[..frames].fill(0.0);
                self.edge_r[..frames].fill(0.0);

                if bus.output == Some(target) {
                    for i in 0..frames {
                        self.edge_l[i] += self.post_l[i];
                        self.edge_r[i] += self.post_r[i];
                    }
                }
                for (si, send) in bus.sends.iter().enumerate() {
                    if !send.enabled || send.target != target {
                        continue;
                    }
                    let level = params
                        .get(&ParamKey::TrackControl {
                            bus: id,
                            control: TrackControl::SendLevel(si as u32),
                        })
                        .map(|p| p.latch_block())
                        .unwrap_or(send.level);
                    if send.pre_fader {
                        for i in 0..frames {
                            self.edge_l[i] += self.work_l[i] * level;
                            self.edge_r[i] += self.work_r[i] * level;
                        }
                    } else {
                        for i in 0..frames {
                            self.edge_l[i] += self.post_l[i] * level;
                            self.edge_r[i] += self.post_r[i] * level;
                        }
                    }
                }

                if let Some(delay) = self.edge_delays.get_mut(&(id, target)) {
                    delay.process(&mut self.edge_l[..frames], &mut self.edge_r[..frames], frames);
                }

                let target_rt = self.runtime.get_mut(&target).expect("edges stay in the arena");
                for i in 0..frames {
                    target_rt.in_l[i] += self.edge_l[i];
                    target_rt.in_r[i] += self.edge_r[i];
                }
            }
        }
    }

    // -- persistence --------------------------------------------------------

    pub fn export_buses(&self) -> Vec<Bus> {
        let mut buses: Vec<Bus> = self.buses.values().cloned().collect();
        buses.sort_by_key(|b| b.id);
        buses
    }

    /// Rebuild the graph from a serialized bus list.
    pub fn import_buses(&mut self, buses: Vec<Bus>, params: &ParameterSet) -> Result<()> {
        let master = buses
            .iter()
            .find(|b| b.kind == BusKind::Master)
            .ok_or_else(|| EngineError::Config("session has no master bus".into()))?
            .id;

        self.buses.clear();
        self.runtime.clear();
        self.edge_delays.clear();
        self.master = master;
        self.next_id = buses.iter().map(|b| b.id.0 + 1).max().unwrap_or(1);

        for bus in buses {
            self.register_strip_params(&bus, params);
            for (si, send) in bus.sends.iter().enumerate() {
                params.register(Parameter::new(
                    ParamKey::TrackControl {
                        bus: bus.id,
                        control: TrackControl::SendLevel(si as u32),
                    },
                    format!("{} Send {}", bus.name, si + 1),
                    ParamRange::new(0.0, 1.5, send.level),
                ));
            }
            for target in bus.downstream() {
                self.edge_delays.insert((bus.id, target), DelayLine::new(0));
            }
            self.runtime.insert(
                bus.id,
                BusRuntime::new(self.sample_rate, self.max_block, bus.kind == BusKind::Master),
            );
            self.buses.insert(bus.id, bus);
        }

        self.recompute_order();
        if self.order.len() != self.buses.len() {
            return Err(EngineError::Config("session routing contains a cycle".into()));
        }
        self.recompute_audible();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> (BusGraph, ParameterSet, PluginHost) {
        (
            BusGraph::new(44100.0, 256),
            ParameterSet::new(),
            PluginHost::new(44100.0, 256),
        )
    }

    #[test]
    fn cycles_are_rejected() {
        let (mut g, params, _) = graph();
        let a = g.create_bus(BusKind::Group, "A", &params).unwrap();
        let b = g.create_bus(BusKind::Group, "B", &params).unwrap();
        g.connect(a, b, SendSpec::post_fader(b, 1.0), &params).unwrap();
        let err = g.connect(b, a, SendSpec::post_fader(a, 1.0), &params).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        // A bus also cannot feed itself.
        assert!(g.connect(a, a, SendSpec::post_fader(a, 1.0), &params).is_err());
    }

    #[test]
    fn topological_order_puts_sources_before_targets() {
        let (mut g, params, _) = graph();
        let track = g.create_bus(BusKind::Track, "Drums", &params).unwrap();
        let group = g.create_bus(BusKind::Group, "Drum Bus", &params).unwrap();
        g.set_output(track, Some(group)).unwrap();

        let pos = |id: BusId| g.order.iter().position(|x| *x == id).unwrap();
        assert!(pos(track) < pos(group));
        assert!(pos(group) < pos(g.master()));
    }

    #[test]
    fn solo_in_place_keeps_path_and_feeders_audible() {
        let (mut g, params, _) = graph();
        let drums = g.create_bus(BusKind::Track, "Drums", &params).unwrap();
        let drum_bus = g.create_bus(BusKind::Group, "Drum Bus", &params).unwrap();
        let vox = g.create_bus(BusKind::Track, "Vox", &params).unwrap();
        g.set_output(drums, Some(drum_bus)).unwrap();

        g.set_solo(drum_bus, true);
        assert!(g.is_audible(drum_bus));
        assert!(g.is_audible(drums), "feeder of the soloed bus stays audible");
        assert!(g.is_audible(g.master()), "path to master stays audible");
        assert!(!g.is_audible(vox), "unrelated bus is suppressed");

        g.set_solo(drum_bus, false);
        assert!(g.is_audible(vox));
    }

    #[test]
    fn explicit_mute_wins_over_solo() {
        let (mut g, params, _) = graph();
        let a = g.create_bus(BusKind::Track, "A", &params).unwrap();
        g.set_mute(a, true);
        g.set_solo(a, true);
        assert!(!g.is_audible(a));
    }

    #[test]
    fn clearing_solo_restores_prior_mutes() {
        let (mut g, params, _) = graph();
        let a = g.create_bus(BusKind::Track, "A", &params).unwrap();
        let b = g.create_bus(BusKind::Track, "B", &params).unwrap();
        g.set_mute(b, true);
        g.set_solo(a, true);
        g.set_solo(a, false);
        assert!(g.is_audible(a));
        assert!(!g.is_audible(b), "B's explicit mute survived the solo pass");
        assert!(g.bus(b).unwrap().strip.mute);
    }

    #[test]
    fn pdc_pads_the_shorter_path() {
        use crate::constants::{PLUGIN_BUNDLE_EXTENSION, PLUGIN_MANIFEST_NAME};

        let dir = std::env::temp_dir().join(format!("mixcore-pdc-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let bundle = dir.join(format!("lookahead.{PLUGIN_BUNDLE_EXTENSION}"));
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(
            bundle.join(PLUGIN_MANIFEST_NAME),
            serde_json::json!({
                "name": "lookahead", "kind": "delay", "version": "1",
                "settings": { "samples": 64 }
            })
            .to_string(),
        )
        .unwrap();

        let (mut g, params, mut host) = graph();
        let group = g.create_bus(BusKind::Group, "Group", &params).unwrap();
        let direct = g.create_bus(BusKind::Track, "Direct", &params).unwrap();

        let plugin = host.load(&bundle, &params).unwrap();
        host.activate(plugin, 44100.0, 256).unwrap();
        g.add_effect(group, plugin).unwrap();
        g.refresh_latency(&host);

        // The path bypassing the 64-sample chain gets exactly 64 samples of
        // compensation at the master.
        assert_eq!(g.compensation_delay(direct, g.master()), 64);
        assert_eq!(g.compensation_delay(group, g.master()), 0);
        assert_eq!(
            g.path_latency_to_master(direct, &host),
            g.path_latency_to_master(group, &host)
        );
    }

    #[test]
    fn compensated_paths_arrive_aligned() {
        use crate::constants::{PLUGIN_BUNDLE_EXTENSION, PLUGIN_MANIFEST_NAME};

        let dir = std::env::temp_dir().join(format!("mixcore-align-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let bundle = dir.join(format!("lag.{PLUGIN_BUNDLE_EXTENSION}"));
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(
            bundle.join(PLUGIN_MANIFEST_NAME),
            serde_json::json!({
                "name": "lag", "kind": "delay", "version": "1",
                "settings": { "samples": 16 }
            })
            .to_string(),
        )
        .unwrap();

        let (mut g, params, mut host) = graph();
        let a = g.create_bus(BusKind::Track, "A", &params).unwrap();
        let b = g.create_bus(BusKind::Track, "B", &params).unwrap();
        let plugin = host.load(&bundle, &params).unwrap();
        host.activate(plugin, 44100.0, 256).unwrap();
        g.add_effect(a, plugin).unwrap();
        g.refresh_latency(&host);

        // Same impulse into both tracks; unity gain, centered pan.
        for id in [a, b] {
            params
                .get(&ParamKey::TrackControl { bus: id, control: TrackControl::Volume })
                .unwrap()
                .set(1.0);
            params
                .get(&ParamKey::TrackControl { bus: id, control: TrackControl::Pan })
                .unwrap()
                .set(0.0);
        }
        let mut impulse = vec![0.0f32; 256];
        impulse[0] = 0.5;
        g.feed_input(a, &impulse, &impulse);
        g.feed_input(b, &impulse, &impulse);

        let mut out_l = vec![0.0f32; 256];
        let mut out_r = vec![0.0f32; 256];
        g.process_block(&mut host, &params, &[], &mut out_l, &mut out_r, 256);

        // Both impulses should land on the same output sample; had one path
        // been uncompensated there would be two distinct spikes.
        let nonzero: Vec<usize> =
            out_l.iter().enumerate().filter(|(_, s)| s.abs() > 1e-6).map(|(i, _)| i).collect();
        assert_eq!(nonzero.len(), 1, "impulses misaligned: {nonzero:?}");
        assert_eq!(nonzero[0], 16);
    }

    #[test]
    fn idle_buses_skip_processing_until_fed() {
        let (mut g, params, mut host) = graph();
        let track = g.create_bus(BusKind::Track, "Quiet", &params).unwrap();
        g.set_idle_threshold(2);

        let mut out_l = vec![0.0f32; 256];
        let mut out_r = vec![0.0f32; 256];
        for _ in 0..5 {
            g.process_block(&mut host, &params, &[], &mut out_l, &mut out_r, 256);
        }
        assert!(g.runtime[&track].idle_blocks > 2);

        let loud = vec![0.25f32; 256];
        g.feed_input(track, &loud, &loud);
        g.process_block(&mut host, &params, &[], &mut out_l, &mut out_r, 256);
        assert_eq!(g.runtime[&track].idle_blocks, 0);
        assert!(out_l.iter().any(|s| s.abs() > 0.0));
    }

    #[test]
    fn pre_fader_send_ignores_the_fader() {
        let (mut g, params, mut host) = graph();
        let track = g.create_bus(BusKind::Track, "Src", &params).unwrap();
        let aux = g.create_bus(BusKind::Aux, "Verb", &params).unwrap();
        g.connect(
            track,
            aux,
            SendSpec { target: aux, level: 1.0, pre_fader: true, enabled: true },
            &params,
        )
        .unwrap();
        // Fader fully down.
        params
            .get(&ParamKey::TrackControl { bus: track, control: TrackControl::Volume })
            .unwrap()
            .set(0.0);

        let signal = vec![0.5f32; 256];
        g.feed_input(track, &signal, &signal);
        let mut out_l = vec![0.0f32; 256];
        let mut out_r = vec![0.0f32; 256];
        g.process_block(&mut host, &params, &[], &mut out_l, &mut out_r, 256);

        let aux_reading = g.latest_reading(aux).unwrap();
        assert!(aux_reading.peak_l > 0.1, "pre-fader send should still feed the aux");
    }

    #[test]
    fn export_import_round_trip() {
        let (mut g, params, _) = graph();
        let t = g.create_bus(BusKind::Track, "Keys", &params).unwrap();
        let aux = g.create_bus(BusKind::Aux, "Delay", &params).unwrap();
        g.connect(t, aux, SendSpec::post_fader(aux, 0.4), &params).unwrap();
        g.set_mute(aux, true);

        let exported = g.export_buses();
        let mut g2 = BusGraph::new(44100.0, 256);
        let params2 = ParameterSet::new();
        g2.import_buses(exported.clone(), &params2).unwrap();
        assert_eq!(g2.export_buses(), exported);
        assert!(g2.bus(aux).unwrap().strip.mute);
        assert_eq!(g2.bus(t).unwrap().sends[0].level, 0.4);
    }
}
